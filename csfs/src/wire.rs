use std::{
	io::{BufRead, BufReader, Error, ErrorKind, Read, Result as IoResult, Write},
	net::TcpStream,
};

/// Longest accepted request line, newline included.
pub const MAX_LINE: usize = 1024;

/// Buffered reader plus writer half of one stream.  Commands are read
/// line-wise; raw payloads are pulled from the same buffered side so no
/// byte is lost between the two framings.
pub struct LineConn {
	r: BufReader<TcpStream>,
	w: TcpStream,
}

impl LineConn {
	pub fn new(stream: TcpStream) -> IoResult<Self> {
		let w = stream.try_clone()?;
		Ok(Self {
			r: BufReader::new(stream),
			w,
		})
	}

	/// Read one newline-terminated line.  `Ok(None)` means the peer closed
	/// the connection.
	pub fn read_line(&mut self) -> IoResult<Option<String>> {
		read_line(&mut self.r, MAX_LINE)
	}

	pub fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
		self.r.read_exact(buf)
	}

	pub fn write_all(&mut self, buf: &[u8]) -> IoResult<()> {
		self.w.write_all(buf)
	}
}

/// Read one `\n`-terminated line of at most `max` bytes, retrying on
/// interruption.  EOF before any byte yields `Ok(None)`; EOF mid-line
/// yields the partial line, which the caller's parse then rejects.
pub fn read_line<R: BufRead>(r: &mut R, max: usize) -> IoResult<Option<String>> {
	let mut line: Vec<u8> = Vec::new();
	loop {
		let avail = match r.fill_buf() {
			Ok(b) => b,
			Err(e) if e.kind() == ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		};
		if avail.is_empty() {
			if line.is_empty() {
				return Ok(None);
			}
			break;
		}
		let (used, done) = match avail.iter().position(|&b| b == b'\n') {
			Some(i) => (i + 1, true),
			None => (avail.len(), false),
		};
		line.extend_from_slice(&avail[..used]);
		r.consume(used);
		if line.len() > max {
			return Err(Error::new(ErrorKind::InvalidData, "request line too long"));
		}
		if done {
			break;
		}
	}
	if line.last() == Some(&b'\n') {
		line.pop();
	}
	String::from_utf8(line)
		.map(Some)
		.map_err(|_| Error::new(ErrorKind::InvalidData, "request line is not valid text"))
}
