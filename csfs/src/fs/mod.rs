//! The filesystem server: a flat namespace of named files over the block
//! device.  One worker per client session, each with its own dedicated
//! device connection; all directory and allocation-table mutations are
//! serialized by a single process-wide metadata mutex.

use std::{
	io::{Error as IoError, ErrorKind, Result as IoResult},
	net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	thread,
};

use crate::{
	codec,
	disk::DiskClient,
	err,
	geom::Geometry,
	layout::{Dirent, Layout, Superblock, BLOCK_SIZE, FAT_EOC, FAT_FREE, FAT_RESERVED, NAME_MAX},
	wire::LineConn,
};

mod client;
mod dir;
mod fat;

pub use self::client::{FsClient, FsStatus};

/// One request line of the filesystem protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCommand {
	Format,
	Create(String),
	Delete(String),
	List { with_length: bool },
	Read(String),
	Write { name: String, len: i64 },
}

impl FsCommand {
	pub fn parse(line: &str) -> Option<Self> {
		let mut f = line.split_whitespace();
		let cmd = match f.next()? {
			"F" => Self::Format,
			"C" => Self::Create(f.next()?.to_string()),
			"D" => Self::Delete(f.next()?.to_string()),
			// the flag's sense is historical: literal "0" lists names
			// only, anything else appends lengths
			"L" => Self::List {
				with_length: f.next()? != "0",
			},
			"R" => Self::Read(f.next()?.to_string()),
			"W" => Self::Write {
				name: f.next()?.to_string(),
				len:  f.next()?.parse().ok()?,
			},
			_ => return None,
		};
		match f.next() {
			Some(_) => None,
			None => Some(cmd),
		}
	}
}

/// Process-wide filesystem state, shared by every session and guarded by
/// one mutex.  The allocation-table cache is loaded lazily and written
/// back on every mutation.
#[derive(Default)]
struct Meta {
	formatted: bool,
	layout:    Option<Layout>,
	fat:       Option<Vec<u32>>,
}

impl Meta {
	/// The adopted layout, or `EINVAL` while the device is unformatted.
	fn layout(&self) -> IoResult<Layout> {
		match self.layout {
			Some(layout) if self.formatted => Ok(layout),
			_ => Err(err!(EINVAL)),
		}
	}
}

/// Map a request failure onto its wire status digit.  Semantic errnos
/// reply and leave the session running; anything else propagates and ends
/// the session.
fn semantic_code(e: &IoError) -> Option<u8> {
	match e.raw_os_error() {
		Some(libc::ENOENT) | Some(libc::EEXIST) => Some(1),
		Some(libc::ENOSPC) | Some(libc::EINVAL) | Some(libc::ENXIO) | Some(libc::EIO) => Some(2),
		_ => None,
	}
}

/// Names are 1..=31 bytes of printable ASCII with no whitespace.  A
/// trailing `/` is as opaque as any other byte here; directory emulation
/// happens entirely on the client side.
fn check_name(name: &str) -> IoResult<()> {
	let b = name.as_bytes();
	if b.is_empty() || b.len() > NAME_MAX || !b.iter().all(|c| (0x21..=0x7e).contains(c)) {
		return Err(err!(EINVAL));
	}
	Ok(())
}

/// The filesystem server.
pub struct FsServer {
	listener:  TcpListener,
	disk_addr: SocketAddr,
	meta:      Arc<Mutex<Meta>>,
	stop:      Arc<AtomicBool>,
}

impl FsServer {
	/// Bind the listener and resolve the block-device address.  The device
	/// itself is dialed once per accepted session.
	pub fn bind(addr: impl ToSocketAddrs, disk_addr: impl ToSocketAddrs) -> IoResult<Self> {
		let disk_addr = disk_addr
			.to_socket_addrs()?
			.next()
			.ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "cannot resolve device address"))?;
		Ok(Self {
			listener: TcpListener::bind(addr)?,
			disk_addr,
			meta: Arc::new(Mutex::new(Meta::default())),
			stop: Arc::new(AtomicBool::new(false)),
		})
	}

	pub fn local_addr(&self) -> IoResult<SocketAddr> {
		self.listener.local_addr()
	}

	/// Flag observed between accepts; raise it to make
	/// [`serve`](Self::serve) return.
	pub fn stop_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.stop)
	}

	/// Accept sessions until the stop flag is raised.
	pub fn serve(&self) -> IoResult<()> {
		log::info!(
			"filesystem on {:?}, block device at {}",
			self.listener.local_addr()?,
			self.disk_addr
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
			log::debug!("session connected: {peer}");
			let meta = Arc::clone(&self.meta);
			let disk_addr = self.disk_addr;
			thread::spawn(move || {
				match Session::open(stream, disk_addr, meta) {
					Ok(mut session) => {
						if let Err(e) = session.run() {
							log::debug!("session {peer}: {e}");
						}
					}
					Err(e) => log::warn!("session {peer} setup failed: {e}"),
				}
				log::debug!("session disconnected: {peer}");
			});
		}
		log::info!("filesystem shutting down");
		Ok(())
	}
}

/// One client connection plus its dedicated device connection.
struct Session {
	conn: LineConn,
	disk: DiskClient,
	geom: Geometry,
	meta: Arc<Mutex<Meta>>,
}

impl Session {
	fn open(stream: TcpStream, disk_addr: SocketAddr, meta: Arc<Mutex<Meta>>) -> IoResult<Self> {
		let disk = DiskClient::connect(disk_addr)?;
		let geom = disk.geometry();
		let mut session = Self {
			conn: LineConn::new(stream)?,
			disk,
			geom,
			meta,
		};
		session.adopt_superblock()?;
		Ok(session)
	}

	/// Detect a previously formatted device: load block 0 and adopt the
	/// recorded layout if the magic tag matches.  Idempotent across
	/// sessions.
	fn adopt_superblock(&mut self) -> IoResult<()> {
		let block = self.disk.read_index(0)?;
		let Ok(sb) = codec::decode::<Superblock>(&block) else {
			return Ok(());
		};
		let Some(layout) = Layout::from_superblock(&sb, &self.geom) else {
			return Ok(());
		};
		let mut meta = self.meta.lock().unwrap();
		if !meta.formatted {
			log::debug!("adopting formatted device: {layout:?}");
			meta.formatted = true;
			meta.layout = Some(layout);
		}
		Ok(())
	}

	fn run(&mut self) -> IoResult<()> {
		while let Some(line) = self.conn.read_line()? {
			if line.is_empty() {
				continue;
			}
			let Some(cmd) = FsCommand::parse(&line) else {
				log::debug!("malformed request: {line:?}");
				return Ok(());
			};
			log::trace!("{cmd:?}");
			self.dispatch(cmd)?;
		}
		Ok(())
	}

	fn dispatch(&mut self, cmd: FsCommand) -> IoResult<()> {
		match cmd {
			FsCommand::Format => {
				let r = self.format();
				self.reply_status(r)
			}
			FsCommand::Create(name) => {
				let r = self.create(&name);
				self.reply_status(r)
			}
			FsCommand::Delete(name) => {
				let r = self.delete(&name);
				self.reply_status(r)
			}
			FsCommand::List { with_length } => self.list(with_length),
			FsCommand::Read(name) => {
				let r = self.read_file(&name);
				self.reply_read(r)
			}
			FsCommand::Write { name, len } => {
				let r = self.write_file(&name, len);
				self.reply_status(r)
			}
		}
	}

	fn reply_status(&mut self, r: IoResult<()>) -> IoResult<()> {
		match r {
			Ok(()) => self.conn.write_all(b"0\n"),
			Err(e) => match semantic_code(&e) {
				Some(code) => {
					log::debug!("request failed: {e}");
					self.conn.write_all(format!("{code}\n").as_bytes())
				}
				None => Err(e),
			},
		}
	}

	fn reply_read(&mut self, r: IoResult<Vec<u8>>) -> IoResult<()> {
		match r {
			Ok(data) => {
				let mut out = format!("0 {} ", data.len()).into_bytes();
				out.extend_from_slice(&data);
				out.push(b'\n');
				self.conn.write_all(&out)
			}
			Err(e) => match semantic_code(&e) {
				Some(code) => {
					log::debug!("read failed: {e}");
					self.conn.write_all(format!("{code} 0 \n").as_bytes())
				}
				None => Err(e),
			},
		}
	}

	/// `F`: lay the metadata out for the current geometry and reset every
	/// table.  The whole pass runs under the metadata mutex.
	fn format(&mut self) -> IoResult<()> {
		let layout = Layout::compute(&self.geom)?;
		let mut meta = self.meta.lock().unwrap();
		log::debug!("formatting: {layout:?}");

		let mut block = [0u8; BLOCK_SIZE];
		codec::encode(&layout.superblock(&self.geom), &mut block)?;
		self.disk.write_index(0, &block)?;

		// fresh table: metadata reserved, everything behind it free
		let mut fat = vec![FAT_FREE; layout.total_blocks as usize];
		for e in &mut fat[..layout.data_start() as usize] {
			*e = FAT_RESERVED;
		}
		fat::flush(&mut self.disk, &layout, &fat)?;

		let zero = [0u8; BLOCK_SIZE];
		for b in layout.dir_start..layout.dir_start + layout.dir_len {
			self.disk.write_index(b as u64, &zero)?;
		}

		meta.formatted = true;
		meta.layout = Some(layout);
		meta.fat = Some(fat);
		Ok(())
	}

	/// `C`: claim the first unused directory slot for a fresh empty file.
	fn create(&mut self, name: &str) -> IoResult<()> {
		check_name(name)?;
		let meta = self.meta.lock().unwrap();
		let layout = meta.layout()?;
		if dir::lookup(&mut self.disk, &layout, name)?.is_some() {
			return Err(err!(EEXIST));
		}
		let Some(slot) = dir::free_slot(&mut self.disk, &layout)? else {
			return Err(err!(ENOSPC));
		};
		dir::write_slot(&mut self.disk, &layout, slot, &Dirent::new(name))
	}

	/// `D`: release the chain, flush the table, zero the slot.
	fn delete(&mut self, name: &str) -> IoResult<()> {
		let mut meta = self.meta.lock().unwrap();
		let layout = meta.layout()?;
		let Some((slot, ent)) = dir::lookup(&mut self.disk, &layout, name)? else {
			return Err(err!(ENOENT));
		};
		let fat = fat::cached(&mut meta, &mut self.disk, &layout)?;
		if ent.length > 0 || ent.first != FAT_EOC {
			fat::free_chain(fat, &layout, ent.first)?;
		}
		fat::flush(&mut self.disk, &layout, fat)?;
		dir::write_slot(&mut self.disk, &layout, slot, &Dirent::empty())
	}

	/// `L`: a point-in-time snapshot taken without the metadata mutex;
	/// only the layout is copied under it.
	fn list(&mut self, with_length: bool) -> IoResult<()> {
		let layout = {
			let meta = self.meta.lock().unwrap();
			meta.layout().ok()
		};
		let mut out = String::new();
		match layout {
			None => out.push_str("filesystem is not formatted\n"),
			Some(layout) => {
				for ent in dir::entries(&mut self.disk, &layout)? {
					if ent.used != 1 {
						continue;
					}
					if with_length {
						out.push_str(&format!("{} {}\n", ent.name(), ent.length));
					} else {
						out.push_str(&format!("{}\n", ent.name()));
					}
				}
			}
		}
		// a blank line closes the listing
		out.push('\n');
		self.conn.write_all(out.as_bytes())
	}

	/// `R`: collect the file under the mutex; the reply is emitted by the
	/// dispatcher after the guard is gone.
	fn read_file(&mut self, name: &str) -> IoResult<Vec<u8>> {
		let mut meta = self.meta.lock().unwrap();
		if !meta.formatted {
			// reads miss rather than fail on an unformatted device
			return Err(err!(ENOENT));
		}
		let layout = meta.layout()?;
		let Some((_slot, ent)) = dir::lookup(&mut self.disk, &layout, name)? else {
			return Err(err!(ENOENT));
		};

		let mut data = vec![0u8; ent.length as usize];
		if ent.length > 0 {
			let fat = fat::cached(&mut meta, &mut self.disk, &layout)?;
			let chain = fat::walk(fat, &layout, ent.first, ent.length)?;
			for (i, &idx) in chain.iter().enumerate() {
				let block = self.disk.read_index(idx as u64)?;
				let off = i * BLOCK_SIZE;
				let n = (data.len() - off).min(BLOCK_SIZE);
				data[off..off + n].copy_from_slice(&block[..n]);
			}
		}
		Ok(data)
	}

	/// `W`: replace the file's contents.  A length the device could never
	/// hold is refused before any payload buffer is sized; otherwise the
	/// payload is drained before any lock is taken so the stream stays
	/// framed even when the command fails.  A failed allocation restores
	/// both the partial reservation and the freed prior chain.
	fn write_file(&mut self, name: &str, len: i64) -> IoResult<()> {
		if len < 0 || len as u64 > self.geom.total_bytes() {
			return Err(err!(EINVAL));
		}
		let mut data = vec![0u8; len as usize];
		self.conn.read_exact(&mut data)?;

		let mut meta = self.meta.lock().unwrap();
		let layout = meta.layout()?;
		let Some((slot, mut ent)) = dir::lookup(&mut self.disk, &layout, name)? else {
			return Err(err!(ENOENT));
		};
		let fat = fat::cached(&mut meta, &mut self.disk, &layout)?;

		let freed = if ent.length > 0 || ent.first != FAT_EOC {
			fat::free_chain(fat, &layout, ent.first)?
		} else {
			Vec::new()
		};

		let chain = if data.is_empty() {
			Vec::new()
		} else {
			let blocks = data.len().div_ceil(BLOCK_SIZE);
			match fat::alloc_chain(fat, &layout, blocks) {
				Some(chain) => chain,
				None => {
					fat::undo(fat, &freed);
					return Err(err!(ENOSPC));
				}
			}
		};

		for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
			if let Err(e) = self.disk.write_index(chain[i] as u64, chunk) {
				// nothing was flushed yet; put the cache back
				for &idx in &chain {
					fat[idx as usize] = FAT_FREE;
				}
				fat::undo(fat, &freed);
				return Err(e);
			}
		}

		if let Err(e) = fat::flush(&mut self.disk, &layout, fat) {
			for &idx in &chain {
				fat[idx as usize] = FAT_FREE;
			}
			fat::undo(fat, &freed);
			return Err(e);
		}

		ent.length = data.len() as u32;
		ent.first = chain.first().copied().unwrap_or(FAT_EOC);
		dir::write_slot(&mut self.disk, &layout, slot, &ent)
	}
}

#[cfg(test)]
mod t {
	use super::*;

	mod parse {
		use super::*;

		#[test]
		fn commands() {
			assert_eq!(FsCommand::parse("F"), Some(FsCommand::Format));
			assert_eq!(FsCommand::parse("C foo"), Some(FsCommand::Create("foo".into())));
			assert_eq!(FsCommand::parse("D a/b/"), Some(FsCommand::Delete("a/b/".into())));
			assert_eq!(
				FsCommand::parse("L 0"),
				Some(FsCommand::List {
					with_length: false
				})
			);
			assert_eq!(
				FsCommand::parse("L 1"),
				Some(FsCommand::List {
					with_length: true
				})
			);
			assert_eq!(FsCommand::parse("R foo"), Some(FsCommand::Read("foo".into())));
			assert_eq!(
				FsCommand::parse("W foo 42"),
				Some(FsCommand::Write {
					name: "foo".into(),
					len:  42
				})
			);
		}

		#[test]
		fn negative_write_length_parses() {
			assert_eq!(
				FsCommand::parse("W foo -1"),
				Some(FsCommand::Write {
					name: "foo".into(),
					len:  -1
				})
			);
		}

		#[test]
		fn malformed() {
			assert_eq!(FsCommand::parse("X"), None);
			assert_eq!(FsCommand::parse("C"), None);
			assert_eq!(FsCommand::parse("C a b"), None);
			assert_eq!(FsCommand::parse("L"), None);
			assert_eq!(FsCommand::parse("W foo"), None);
			assert_eq!(FsCommand::parse("W foo x"), None);
		}
	}

	mod names {
		use super::*;

		#[test]
		fn accepted() {
			assert!(check_name("a").is_ok());
			assert!(check_name("foo.txt").is_ok());
			assert!(check_name("a/b/").is_ok());
			assert!(check_name(&"x".repeat(31)).is_ok());
		}

		#[test]
		fn rejected() {
			assert!(check_name("").is_err());
			assert!(check_name(&"x".repeat(32)).is_err());
			assert!(check_name("has space").is_err());
			assert!(check_name("t\u{e9}l\u{e9}").is_err());
			assert!(check_name("ctrl\u{1}char").is_err());
		}
	}

	#[test]
	fn errno_to_wire_code() {
		assert_eq!(semantic_code(&err!(ENOENT)), Some(1));
		assert_eq!(semantic_code(&err!(EEXIST)), Some(1));
		assert_eq!(semantic_code(&err!(ENOSPC)), Some(2));
		assert_eq!(semantic_code(&err!(EINVAL)), Some(2));
		assert_eq!(semantic_code(&err!(EIO)), Some(2));
		let transport = IoError::new(ErrorKind::UnexpectedEof, "eof");
		assert_eq!(semantic_code(&transport), None);
	}

	mod stack {
		use std::io::{Read, Write};

		use super::*;
		use crate::disk::DiskServer;

		fn stack() -> (FsClient, SocketAddr, tempfile::NamedTempFile) {
			let file = tempfile::NamedTempFile::new().unwrap();
			let disk =
				DiskServer::bind(("127.0.0.1", 0), Geometry::new(16, 16), 0, file.path()).unwrap();
			let disk_addr = disk.local_addr().unwrap();
			thread::spawn(move || disk.serve());

			let fs = FsServer::bind(("127.0.0.1", 0), disk_addr).unwrap();
			let fs_addr = fs.local_addr().unwrap();
			thread::spawn(move || fs.serve());

			(FsClient::connect(fs_addr).unwrap(), fs_addr, file)
		}

		#[test]
		fn format_create_write_read() {
			let (mut fs, _addr, _file) = stack();
			assert_eq!(fs.format().unwrap(), FsStatus::Ok);
			assert_eq!(fs.create("foo").unwrap(), FsStatus::Ok);
			assert_eq!(fs.write("foo", b"abc").unwrap(), FsStatus::Ok);
			assert_eq!(fs.read("foo").unwrap(), (FsStatus::Ok, b"abc".to_vec()));
			assert_eq!(fs.create("foo").unwrap(), FsStatus::NotFound);
			assert_eq!(fs.delete("foo").unwrap(), FsStatus::Ok);
			assert_eq!(fs.read("foo").unwrap(), (FsStatus::NotFound, vec![]));
		}

		#[test]
		fn bad_names_are_refused() {
			let (mut fs, _addr, _file) = stack();
			assert_eq!(fs.format().unwrap(), FsStatus::Ok);
			assert_eq!(fs.create(&"x".repeat(32)).unwrap(), FsStatus::Failed);
		}

		#[test]
		fn malformed_request_ends_the_session() {
			let (mut fs, _addr, _file) = stack();
			assert_eq!(fs.format().unwrap(), FsStatus::Ok);
			// a name with whitespace is not even parseable; the server
			// hangs up without a reply
			assert!(fs.create("bad name").is_err());
		}

		#[test]
		fn directory_slots_are_finite() {
			let (mut fs, _addr, _file) = stack();
			assert_eq!(fs.format().unwrap(), FsStatus::Ok);
			for i in 0..64 {
				assert_eq!(fs.create(&format!("f{i}")).unwrap(), FsStatus::Ok);
			}
			assert_eq!(fs.create("straw").unwrap(), FsStatus::Failed);
			assert_eq!(fs.delete("f63").unwrap(), FsStatus::Ok);
			assert_eq!(fs.create("straw").unwrap(), FsStatus::Ok);
		}

		#[test]
		fn absurd_write_length_is_refused_before_allocation() {
			let (mut fs, addr, _file) = stack();
			assert_eq!(fs.format().unwrap(), FsStatus::Ok);
			assert_eq!(fs.create("foo").unwrap(), FsStatus::Ok);

			// no payload follows; the server must refuse on the length
			// alone and keep serving
			let mut raw = TcpStream::connect(addr).unwrap();
			raw.set_read_timeout(Some(std::time::Duration::from_secs(10)))
				.unwrap();
			raw.write_all(b"W foo 9000000000000\n").unwrap();
			let mut reply = [0u8; 2];
			raw.read_exact(&mut reply).unwrap();
			assert_eq!(&reply, b"2\n");

			assert_eq!(fs.write("foo", b"ok").unwrap(), FsStatus::Ok);
		}
	}
}
