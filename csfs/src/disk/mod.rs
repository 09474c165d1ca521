//! The block-device server: 128-byte blocks keyed by cylinder and sector,
//! one worker thread per client, a single simulated arm serializing every
//! access to the memory-mapped image.

use std::{
	io::{ErrorKind, Result as IoResult},
	net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	thread,
	time::Duration,
};

use crate::{
	geom::Geometry,
	layout::{Block, BLOCK_SIZE},
	wire::LineConn,
};

mod client;
mod image;

pub use self::{client::DiskClient, image::DiskImage};

/// One request line of the block-device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCommand {
	Info,
	Read { cylinder: i64, sector: i64 },
	Write { cylinder: i64, sector: i64, len: i64 },
}

impl DiskCommand {
	/// Parse a request line.  Addresses and lengths are taken signed so an
	/// out-of-range value reaches the address check and earns the `'0'`
	/// reply instead of killing the parse.
	pub fn parse(line: &str) -> Option<Self> {
		let mut f = line.split_whitespace();
		let cmd = match f.next()? {
			"I" => Self::Info,
			"R" => Self::Read {
				cylinder: f.next()?.parse().ok()?,
				sector:   f.next()?.parse().ok()?,
			},
			"W" => Self::Write {
				cylinder: f.next()?.parse().ok()?,
				sector:   f.next()?.parse().ok()?,
				len:      f.next()?.parse().ok()?,
			},
			_ => return None,
		};
		match f.next() {
			Some(_) => None,
			None => Some(cmd),
		}
	}
}

struct Arm {
	head:  u64,
	image: DiskImage,
}

struct Disk {
	geom:     Geometry,
	track_us: u64,
	arm:      Mutex<Arm>,
}

impl Disk {
	/// Simulate the track-to-track seek and leave the head on `cylinder`.
	/// Runs with the arm held; the sleep is best-effort.
	fn seek(&self, arm: &mut Arm, cylinder: u64) {
		let delta = arm.head.abs_diff(cylinder);
		if delta > 0 && self.track_us > 0 {
			thread::sleep(Duration::from_micros(delta * self.track_us));
		}
		arm.head = cylinder;
	}
}

/// The block-device server.
pub struct DiskServer {
	listener: TcpListener,
	disk:     Arc<Disk>,
	stop:     Arc<AtomicBool>,
}

impl DiskServer {
	/// Open (or create) the backing file, size it to the geometry, map it,
	/// and bind the listener.
	pub fn bind(
		addr: impl ToSocketAddrs,
		geom: Geometry,
		track_us: u64,
		backing: &Path,
	) -> IoResult<Self> {
		if geom.cylinders == 0 || geom.sectors == 0 {
			iobail!(ErrorKind::InvalidInput, "cylinders and sectors must both be > 0");
		}
		let image = DiskImage::open(backing, geom.total_blocks())?;
		let listener = TcpListener::bind(addr)?;
		Ok(Self {
			listener,
			disk: Arc::new(Disk {
				geom,
				track_us,
				arm: Mutex::new(Arm {
					head: 0,
					image,
				}),
			}),
			stop: Arc::new(AtomicBool::new(false)),
		})
	}

	pub fn local_addr(&self) -> IoResult<SocketAddr> {
		self.listener.local_addr()
	}

	/// Flag observed between accepts; raise it (e.g. from a signal
	/// handler) to make [`serve`](Self::serve) return.
	pub fn stop_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.stop)
	}

	/// Accept clients until the stop flag is raised, one detached worker
	/// per connection.
	pub fn serve(&self) -> IoResult<()> {
		log::info!(
			"block device on {:?}: geometry {}x{}, track time {}us",
			self.listener.local_addr()?,
			self.disk.geom.cylinders,
			self.disk.geom.sectors,
			self.disk.track_us
		);
		loop {
			if self.stop.load(Ordering::Relaxed) {
				break;
			}
			let (stream, peer) = match self.listener.accept() {
				Ok(x) => x,
				Err(e) if e.kind() == ErrorKind::Interrupted => continue,
				Err(e) => return Err(e),
			};
			log::debug!("client connected: {peer}");
			let disk = Arc::clone(&self.disk);
			thread::spawn(move || {
				if let Err(e) = serve_client(&disk, stream) {
					log::debug!("client {peer}: {e}");
				}
				log::debug!("client disconnected: {peer}");
			});
		}
		log::info!("block device shutting down");
		Ok(())
	}
}

fn serve_client(disk: &Disk, stream: TcpStream) -> IoResult<()> {
	let mut conn = LineConn::new(stream)?;
	while let Some(line) = conn.read_line()? {
		if line.is_empty() {
			continue;
		}
		let Some(cmd) = DiskCommand::parse(&line) else {
			log::debug!("malformed request: {line:?}");
			return Ok(());
		};
		log::trace!("{cmd:?}");
		match cmd {
			DiskCommand::Info => {
				let g = disk.geom;
				conn.write_all(format!("{} {}\n", g.cylinders, g.sectors).as_bytes())?;
			}
			DiskCommand::Read { cylinder, sector } => handle_read(disk, cylinder, sector, &mut conn)?,
			DiskCommand::Write { cylinder, sector, len } => {
				handle_write(disk, cylinder, sector, len, &mut conn)?
			}
		}
	}
	Ok(())
}

fn handle_read(disk: &Disk, c: i64, s: i64, conn: &mut LineConn) -> IoResult<()> {
	if !disk.geom.contains(c, s) {
		return conn.write_all(b"0");
	}
	let idx = disk.geom.index(c as u64, s as u64);
	let mut buf: Block = [0u8; BLOCK_SIZE];
	{
		let mut arm = disk.arm.lock().unwrap();
		disk.seek(&mut arm, c as u64);
		buf.copy_from_slice(arm.image.block(idx));
	}
	// the reply leaves outside the arm lock
	conn.write_all(b"1")?;
	conn.write_all(&buf)
}

fn handle_write(disk: &Disk, c: i64, s: i64, len: i64, conn: &mut LineConn) -> IoResult<()> {
	if !disk.geom.contains(c, s) || !(0..=BLOCK_SIZE as i64).contains(&len) {
		// rejected before the payload is consumed, as the original device
		// behaves; any stale payload then fails line parsing
		return conn.write_all(b"0");
	}
	let mut buf: Block = [0u8; BLOCK_SIZE];
	conn.read_exact(&mut buf[..len as usize])?;

	let idx = disk.geom.index(c as u64, s as u64);
	{
		let mut arm = disk.arm.lock().unwrap();
		disk.seek(&mut arm, c as u64);
		arm.image.block_mut(idx).copy_from_slice(&buf);
	}
	conn.write_all(b"1")
}
