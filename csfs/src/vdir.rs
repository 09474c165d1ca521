//! Directory emulation over the flat filesystem.
//!
//! The filesystem knows only names; this module reserves names ending in
//! `/` as directory markers.  A directory at canonical path `/a/b` is a
//! zero-length file named `a/b/`.  The root is implicit and never gets a
//! marker.  Everything here runs on the client side of the FS protocol;
//! the server treats marker names as opaque.

use std::{error, fmt, io};

use crate::fs::{FsClient, FsStatus};

/// Why a directory operation was refused.
#[derive(Debug)]
pub enum DirError {
	/// The transport to the filesystem server failed.
	Io(io::Error),
	/// The root directory cannot be created or removed.
	Root,
	AlreadyExists(String),
	NotFound(String),
	NotEmpty(String),
	/// The server reported an unspecific failure (no space, unformatted).
	Failed,
}

impl fmt::Display for DirError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Io(e) => write!(f, "filesystem connection: {e}"),
			Self::Root => write!(f, "the root directory is implicit"),
			Self::AlreadyExists(p) => write!(f, "'{p}' already exists"),
			Self::NotFound(p) => write!(f, "'{p}' does not exist"),
			Self::NotEmpty(p) => write!(f, "directory '{p}' is not empty"),
			Self::Failed => write!(f, "the filesystem refused the operation"),
		}
	}
}

impl error::Error for DirError {}

impl From<io::Error> for DirError {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}

/// Canonicalize `name` relative to `cwd`: leading `/`, no trailing slash,
/// except the root itself.
pub fn join_path(cwd: &str, name: &str) -> String {
	let mut path = if name.starts_with('/') {
		name.to_string()
	} else if cwd == "/" {
		format!("/{name}")
	} else {
		format!("{cwd}/{name}")
	};
	while path.len() > 1 && path.ends_with('/') {
		path.pop();
	}
	path
}

/// Filesystem name of the marker for `path`; `None` for the implicit
/// root.
pub fn marker_name(path: &str) -> Option<String> {
	if path == "/" {
		None
	} else {
		Some(format!("{}/", &path[1..]))
	}
}

/// One session's view of the virtual directory tree: an FS connection plus
/// the session-local working directory.
pub struct DirClient {
	fs:  FsClient,
	cwd: String,
}

impl DirClient {
	pub fn new(fs: FsClient) -> Self {
		Self {
			fs,
			cwd: "/".to_string(),
		}
	}

	/// The session-local working directory.
	pub fn pwd(&self) -> &str {
		&self.cwd
	}

	/// Create the directory `name` (relative to the working directory, or
	/// absolute).
	pub fn mkdir(&mut self, name: &str) -> Result<(), DirError> {
		let path = join_path(&self.cwd, name);
		let Some(marker) = marker_name(&path) else {
			return Err(DirError::Root);
		};
		match self.fs.create(&marker)? {
			FsStatus::Ok => Ok(()),
			// create's code 1 is a name collision
			FsStatus::NotFound => Err(DirError::AlreadyExists(path)),
			FsStatus::Failed => Err(DirError::Failed),
		}
	}

	/// Enter `name`, probing the marker's existence with a read.
	pub fn cd(&mut self, name: &str) -> Result<(), DirError> {
		let path = join_path(&self.cwd, name);
		let Some(marker) = marker_name(&path) else {
			// the root always exists
			self.cwd = path;
			return Ok(());
		};
		match self.fs.read(&marker)?.0 {
			FsStatus::Ok => {
				self.cwd = path;
				Ok(())
			}
			FsStatus::NotFound => Err(DirError::NotFound(path)),
			FsStatus::Failed => Err(DirError::Failed),
		}
	}

	/// Remove `name`, refusing while anything lives underneath it.
	pub fn rmdir(&mut self, name: &str) -> Result<(), DirError> {
		let path = join_path(&self.cwd, name);
		let Some(marker) = marker_name(&path) else {
			return Err(DirError::Root);
		};

		match self.fs.read(&marker)?.0 {
			FsStatus::Ok => (),
			FsStatus::NotFound => return Err(DirError::NotFound(path)),
			FsStatus::Failed => return Err(DirError::Failed),
		}

		// emptiness check: no entry may have the marker as a proper prefix
		for entry in self.fs.list(false)? {
			if entry.starts_with(marker.as_str()) && entry != marker {
				return Err(DirError::NotEmpty(path));
			}
		}

		match self.fs.delete(&marker)? {
			FsStatus::Ok => Ok(()),
			FsStatus::NotFound => Err(DirError::NotFound(path)),
			FsStatus::Failed => Err(DirError::Failed),
		}
	}
}
