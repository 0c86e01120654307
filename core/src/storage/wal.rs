//! Write-Ahead Logging implementation
//!
//! The log is a flat sequence of frames `[len:4][crc32:4][record:len]`, all
//! integers big-endian. Records describe page mutations:
//!
//! - Insert: `[0][xid:8][page_no:4][offset:2][raw]`
//! - Update: `[1][xid:8][uid:8][old_raw][new_raw]`, both raws the same length
//!
//! A frame whose length runs past the end of the file or whose checksum does
//! not match is a torn tail from a crash; it is cut off when the log opens.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::files;
use super::{PageNo, Uid, Xid, uid_to_address};
use crate::error::{KeelError, KeelResult, fatal};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

const FRAME_HEADER: usize = 8;

const OF_XID: usize = 1;
const OF_INSERT_PAGE: usize = OF_XID + 8;
const OF_INSERT_OFFSET: usize = OF_INSERT_PAGE + 4;
const OF_INSERT_RAW: usize = OF_INSERT_OFFSET + 2;
const OF_UPDATE_UID: usize = OF_XID + 8;
const OF_UPDATE_RAW: usize = OF_UPDATE_UID + 8;

/// A logged page mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
	Insert {
		xid: Xid,
		page_no: PageNo,
		offset: u16,
		raw: Vec<u8>,
	},
	Update {
		xid: Xid,
		uid: Uid,
		old_raw: Vec<u8>,
		new_raw: Vec<u8>,
	},
}

impl LogRecord {
	/// Transaction that performed the mutation
	pub fn xid(&self) -> Xid {
		match self {
			LogRecord::Insert { xid, .. } | LogRecord::Update { xid, .. } => *xid,
		}
	}

	/// Page the mutation touched
	pub fn page_no(&self) -> PageNo {
		match self {
			LogRecord::Insert { page_no, .. } => *page_no,
			LogRecord::Update { uid, .. } => uid_to_address(*uid).0,
		}
	}

	/// Encode to the on-disk record layout
	pub fn encode(&self) -> Vec<u8> {
		match self {
			LogRecord::Insert {
				xid,
				page_no,
				offset,
				raw,
			} => {
				let mut buf = Vec::with_capacity(OF_INSERT_RAW + raw.len());
				buf.push(TYPE_INSERT);
				buf.extend_from_slice(&xid.to_be_bytes());
				buf.extend_from_slice(&page_no.to_be_bytes());
				buf.extend_from_slice(&offset.to_be_bytes());
				buf.extend_from_slice(raw);
				buf
			}
			LogRecord::Update {
				xid,
				uid,
				old_raw,
				new_raw,
			} => {
				debug_assert_eq!(old_raw.len(), new_raw.len());
				let mut buf = Vec::with_capacity(OF_UPDATE_RAW + old_raw.len() * 2);
				buf.push(TYPE_UPDATE);
				buf.extend_from_slice(&xid.to_be_bytes());
				buf.extend_from_slice(&uid.to_be_bytes());
				buf.extend_from_slice(old_raw);
				buf.extend_from_slice(new_raw);
				buf
			}
		}
	}

	/// Decode a record
	pub fn decode(buf: &[u8]) -> KeelResult<Self> {
		let Some(&record_type) = buf.first() else {
			return Err(KeelError::CorruptLog("empty record".into()));
		};

		match record_type {
			TYPE_INSERT => {
				if buf.len() < OF_INSERT_RAW {
					return Err(KeelError::CorruptLog(format!(
						"insert record of {} bytes is shorter than its header",
						buf.len()
					)));
				}
				Ok(LogRecord::Insert {
					xid: read_u64(&buf[OF_XID..]),
					page_no: u32::from_be_bytes(
						buf[OF_INSERT_PAGE..OF_INSERT_OFFSET].try_into().unwrap(),
					),
					offset: u16::from_be_bytes(
						buf[OF_INSERT_OFFSET..OF_INSERT_RAW].try_into().unwrap(),
					),
					raw: buf[OF_INSERT_RAW..].to_vec(),
				})
			}
			TYPE_UPDATE => {
				let body = buf.len().saturating_sub(OF_UPDATE_RAW);
				if buf.len() < OF_UPDATE_RAW || body % 2 != 0 {
					return Err(KeelError::CorruptLog(format!(
						"malformed update record of {} bytes",
						buf.len()
					)));
				}
				let half = body / 2;
				Ok(LogRecord::Update {
					xid: read_u64(&buf[OF_XID..]),
					uid: read_u64(&buf[OF_UPDATE_UID..]),
					old_raw: buf[OF_UPDATE_RAW..OF_UPDATE_RAW + half].to_vec(),
					new_raw: buf[OF_UPDATE_RAW + half..].to_vec(),
				})
			}
			other => Err(KeelError::CorruptLog(format!(
				"unknown record type {}",
				other
			))),
		}
	}
}

fn read_u64(buf: &[u8]) -> u64 {
	u64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Append-only log file
pub struct Wal {
	file: Mutex<File>,
	path: PathBuf,
}

impl Wal {
	/// Create an empty log; fails if the file exists.
	pub fn create<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
		let path = path.as_ref().to_path_buf();
		let file = files::create_new(&path)?;
		file.sync_all()?;

		Ok(Self {
			file: Mutex::new(file),
			path,
		})
	}

	/// Open an existing log, cutting off any torn tail.
	pub fn open<P: AsRef<Path>>(path: P) -> KeelResult<Self> {
		let path = path.as_ref().to_path_buf();
		let mut file = files::open_existing(&path)?;

		let file_len = file.metadata()?.len();
		let valid_len = Self::scan_valid_prefix(&mut file)?;
		if valid_len < file_len {
			tracing::warn!(
				"Truncating torn log tail of {:?}: {} -> {} bytes",
				path,
				file_len,
				valid_len
			);
			file.set_len(valid_len)?;
			file.sync_all()?;
		}

		Ok(Self {
			file: Mutex::new(file),
			path,
		})
	}

	/// Append a record and sync it to disk before returning.
	pub fn append(&self, record: &LogRecord) {
		let data = record.encode();
		let frame = Self::frame(&data);

		let mut file = self.file.lock();
		let res = file
			.seek(SeekFrom::End(0))
			.and_then(|_| file.write_all(&frame))
			.and_then(|_| file.sync_data());
		if let Err(e) = res {
			fatal("log append", e);
		}
	}

	/// Iterate every record from the start of the log.
	pub fn records(&self) -> KeelResult<LogReader> {
		// Own handle so reading never moves the append cursor
		let file = File::open(&self.path)?;
		Ok(LogReader {
			reader: BufReader::new(file),
		})
	}

	/// Location of the log file
	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Flush WAL to disk
	pub fn flush(&self) -> KeelResult<()> {
		self.file.lock().sync_all()?;
		Ok(())
	}

	fn frame(data: &[u8]) -> Vec<u8> {
		let mut frame = Vec::with_capacity(FRAME_HEADER + data.len());
		frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
		frame.extend_from_slice(&crc32fast::hash(data).to_be_bytes());
		frame.extend_from_slice(data);
		frame
	}

	/// Length of the longest prefix made of whole, checksum-valid frames.
	fn scan_valid_prefix(file: &mut File) -> KeelResult<u64> {
		file.seek(SeekFrom::Start(0))?;
		let mut reader = BufReader::new(&*file);
		let mut valid = 0u64;

		while let Some(data) = read_frame(&mut reader)? {
			valid += (FRAME_HEADER + data.len()) as u64;
		}

		Ok(valid)
	}
}

/// Read the next whole frame. `None` at a clean end or a torn tail.
fn read_frame<R: Read>(reader: &mut R) -> KeelResult<Option<Vec<u8>>> {
	let mut header = [0u8; FRAME_HEADER];
	match reader.read_exact(&mut header) {
		Ok(()) => {}
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(KeelError::Io(e)),
	}

	let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
	let checksum = u32::from_be_bytes(header[4..8].try_into().unwrap());

	let mut data = vec![0u8; len];
	match reader.read_exact(&mut data) {
		Ok(()) => {}
		Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
		Err(e) => return Err(KeelError::Io(e)),
	}

	if crc32fast::hash(&data) != checksum {
		return Ok(None);
	}
	Ok(Some(data))
}

/// Sequential reader over log records
pub struct LogReader {
	reader: BufReader<File>,
}

impl Iterator for LogReader {
	type Item = KeelResult<LogRecord>;

	fn next(&mut self) -> Option<Self::Item> {
		match read_frame(&mut self.reader) {
			Ok(Some(data)) => Some(LogRecord::decode(&data)),
			Ok(None) => None,
			Err(e) => Some(Err(e)),
		}
	}
}
