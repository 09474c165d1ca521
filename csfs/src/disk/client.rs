use std::{
	io::{Error, ErrorKind, Result as IoResult},
	net::{TcpStream, ToSocketAddrs},
};

use crate::{
	err,
	geom::Geometry,
	layout::{Block, BLOCK_SIZE},
	wire::LineConn,
};

/// Client side of the block-device protocol.
///
/// Every filesystem session owns exactly one of these, which is what makes
/// a session's device requests totally ordered.
pub struct DiskClient {
	conn: LineConn,
	geom: Geometry,
}

impl DiskClient {
	/// Connect and fetch the device geometry.
	pub fn connect(addr: impl ToSocketAddrs) -> IoResult<Self> {
		let stream = TcpStream::connect(addr)?;
		let mut conn = LineConn::new(stream)?;
		conn.write_all(b"I\n")?;
		let line = conn
			.read_line()?
			.ok_or_else(|| Error::new(ErrorKind::UnexpectedEof, "device closed during handshake"))?;
		let geom = parse_geometry(&line)?;
		log::debug!("connected to block device: {}x{}", geom.cylinders, geom.sectors);
		Ok(Self {
			conn,
			geom,
		})
	}

	pub fn geometry(&self) -> Geometry {
		self.geom
	}

	/// Read one block.  `Ok(None)` means the device rejected the address.
	pub fn read(&mut self, cylinder: u64, sector: u64) -> IoResult<Option<Block>> {
		self.conn.write_all(format!("R {cylinder} {sector}\n").as_bytes())?;
		match self.status()? {
			false => Ok(None),
			true => {
				let mut block = [0u8; BLOCK_SIZE];
				self.conn.read_exact(&mut block)?;
				Ok(Some(block))
			}
		}
	}

	/// Write up to one block; the device zero-pads to 128 bytes.  Returns
	/// `false` iff the device rejected the address.
	pub fn write(&mut self, cylinder: u64, sector: u64, data: &[u8]) -> IoResult<bool> {
		assert!(data.len() <= BLOCK_SIZE);
		let mut msg = format!("W {cylinder} {sector} {}\n", data.len()).into_bytes();
		msg.extend_from_slice(data);
		self.conn.write_all(&msg)?;
		self.status()
	}

	/// Read the block at linear index `idx`.  A rejected address is an
	/// error here: the callers address metadata that must exist.
	pub fn read_index(&mut self, idx: u64) -> IoResult<Block> {
		let (c, s) = self.geom.split(idx);
		self.read(c, s)?.ok_or_else(|| err!(ENXIO))
	}

	/// Write the block at linear index `idx`.
	pub fn write_index(&mut self, idx: u64, data: &[u8]) -> IoResult<()> {
		let (c, s) = self.geom.split(idx);
		if self.write(c, s, data)? {
			Ok(())
		} else {
			Err(err!(ENXIO))
		}
	}

	fn status(&mut self) -> IoResult<bool> {
		let mut status = [0u8; 1];
		self.conn.read_exact(&mut status)?;
		match status[0] {
			b'0' => Ok(false),
			b'1' => Ok(true),
			other => Err(Error::new(
				ErrorKind::InvalidData,
				format!("unexpected status byte {other:#04x} from device"),
			)),
		}
	}
}

fn parse_geometry(line: &str) -> IoResult<Geometry> {
	let mut f = line.split_whitespace();
	let c = f.next().and_then(|t| t.parse::<u64>().ok());
	let s = f.next().and_then(|t| t.parse::<u64>().ok());
	match (c, s, f.next()) {
		(Some(c), Some(s), None) if c > 0 && s > 0 => Ok(Geometry::new(c, s)),
		_ => Err(Error::new(
			ErrorKind::InvalidData,
			format!("bad geometry line {line:?}"),
		)),
	}
}
