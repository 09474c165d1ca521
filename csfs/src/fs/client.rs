use std::{
	io::{Error, ErrorKind, Result as IoResult},
	net::{TcpStream, ToSocketAddrs},
};

use crate::wire::LineConn;

/// Single-digit status of a filesystem reply.  Code 1 means the name was
/// the problem: unknown for delete/read/write, already taken for create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsStatus {
	Ok,
	NotFound,
	Failed,
}

impl FsStatus {
	fn parse(tok: &str) -> IoResult<Self> {
		match tok {
			"0" => Ok(Self::Ok),
			"1" => Ok(Self::NotFound),
			"2" => Ok(Self::Failed),
			other => Err(Error::new(
				ErrorKind::InvalidData,
				format!("unexpected status {other:?}"),
			)),
		}
	}
}

/// Client side of the filesystem protocol, used by the directory emulation
/// and the test suites.
pub struct FsClient {
	conn: LineConn,
}

impl FsClient {
	pub fn connect(addr: impl ToSocketAddrs) -> IoResult<Self> {
		let stream = TcpStream::connect(addr)?;
		Ok(Self {
			conn: LineConn::new(stream)?,
		})
	}

	pub fn format(&mut self) -> IoResult<FsStatus> {
		self.simple("F\n")
	}

	pub fn create(&mut self, name: &str) -> IoResult<FsStatus> {
		self.simple(&format!("C {name}\n"))
	}

	pub fn delete(&mut self, name: &str) -> IoResult<FsStatus> {
		self.simple(&format!("D {name}\n"))
	}

	/// The listing lines, without the blank end-of-output marker.
	pub fn list(&mut self, with_length: bool) -> IoResult<Vec<String>> {
		let flag = if with_length { '1' } else { '0' };
		self.conn.write_all(format!("L {flag}\n").as_bytes())?;
		let mut lines = Vec::new();
		loop {
			let line = self.expect_line()?;
			if line.is_empty() {
				break;
			}
			lines.push(line);
		}
		Ok(lines)
	}

	/// Fetch a file.  The payload is only meaningful when the status is
	/// [`FsStatus::Ok`].
	pub fn read(&mut self, name: &str) -> IoResult<(FsStatus, Vec<u8>)> {
		self.conn.write_all(format!("R {name}\n").as_bytes())?;

		// header is "<code> <len> ", then the raw payload and a newline
		let code = FsStatus::parse(&self.token()?)?;
		let len: usize = self
			.token()?
			.parse()
			.map_err(|_| Error::new(ErrorKind::InvalidData, "bad read length"))?;

		let mut data = vec![0u8; len];
		self.conn.read_exact(&mut data)?;
		let mut nl = [0u8; 1];
		self.conn.read_exact(&mut nl)?;
		Ok((code, data))
	}

	/// One space-terminated token of a reply header.
	fn token(&mut self) -> IoResult<String> {
		let mut tok = Vec::new();
		loop {
			let mut b = [0u8; 1];
			self.conn.read_exact(&mut b)?;
			if b[0] == b' ' {
				break;
			}
			tok.push(b[0]);
			if tok.len() > 32 {
				return Err(Error::new(ErrorKind::InvalidData, "oversized reply token"));
			}
		}
		String::from_utf8(tok).map_err(|_| Error::new(ErrorKind::InvalidData, "bad reply token"))
	}

	pub fn write(&mut self, name: &str, data: &[u8]) -> IoResult<FsStatus> {
		let mut msg = format!("W {name} {}\n", data.len()).into_bytes();
		msg.extend_from_slice(data);
		self.conn.write_all(&msg)?;
		let line = self.expect_line()?;
		FsStatus::parse(line.trim())
	}

	fn simple(&mut self, cmd: &str) -> IoResult<FsStatus> {
		self.conn.write_all(cmd.as_bytes())?;
		let line = self.expect_line()?;
		FsStatus::parse(line.trim())
	}

	fn expect_line(&mut self) -> IoResult<String> {
		self.conn
			.read_line()?
			.ok_or_else(|| Error::new(ErrorKind::UnexpectedEof, "server closed the connection"))
	}
}
