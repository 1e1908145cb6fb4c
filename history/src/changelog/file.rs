use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use prost::Message;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use super::ChangeLog;
use crate::{changes::ChangeSet, proto, Error};

const MAGIC: &[u8; 4] = b"LHCL";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
/// payload length and checksum, both u32 LE
const FRAME_HEADER_LEN: u64 = 8;

fn file_header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(MAGIC);
    header[4..].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

fn encode_frame(change_set: &ChangeSet) -> Result<Vec<u8>, Error> {
    let payload = proto::ChangeSet::from(change_set).encode_to_vec();
    let len = u32::try_from(payload.len()).map_err(|_| {
        Error::InvalidRequest(format!(
            "change set {} is too large to be logged",
            change_set.version
        ))
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn parse_frame_header(buf: &[u8; FRAME_HEADER_LEN as usize]) -> (u32, u32) {
    let (len, crc) = buf.split_at(4);
    (
        u32::from_le_bytes([len[0], len[1], len[2], len[3]]),
        u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]),
    )
}

fn decode_frame(payload: &[u8], crc: u32) -> Result<ChangeSet, Error> {
    if crc32fast::hash(payload) != crc {
        return Err(Error::Corruption("checksum mismatch".into()));
    }

    proto::ChangeSet::decode(payload)
        .map_err(|e| Error::Corruption(format!("unable to decode change set: {}", e)))?
        .try_into()
}

/// Where the frames are. `offsets[v - 1]` is the start of version `v`, `end`
/// the end of the last valid frame.
#[derive(Debug, Default)]
struct Frames {
    offsets: Vec<u64>,
    end: u64,
}

/// A change log in a single append-only file.
///
/// The file starts with an 8 byte header (`LHCL` and a little-endian format
/// version), followed by one frame per change set: its payload length, the
/// CRC-32 of the payload, and the protobuf-encoded change set.
///
/// Opening the file validates every frame. A trailing frame which is
/// incomplete, or invalid without any data following it, is what an
/// interrupted append leaves behind; it is cut off. Any other invalid frame
/// is reported as [Error::Corruption], a different format version as
/// [Error::Conflict].
pub struct FileChangeLog {
    path: PathBuf,
    writer: tokio::sync::Mutex<File>,
    frames: Arc<RwLock<Frames>>,
}

impl FileChangeLog {
    #[instrument(skip_all, err, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let len = file.metadata().await?.len();
        let header = file_header();

        let frames = if len < HEADER_LEN {
            // Either new, or the header write itself was interrupted.
            let mut existing = Vec::new();
            file.read_to_end(&mut existing).await?;
            if !header.starts_with(&existing) {
                return Err(Error::Corruption(format!(
                    "{} is not a change log",
                    path.display()
                )));
            }

            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&header).await?;
            file.flush().await?;
            file.sync_all().await?;
            info!("initialized change log");

            Frames {
                offsets: vec![],
                end: HEADER_LEN,
            }
        } else {
            let mut existing = [0u8; HEADER_LEN as usize];
            file.read_exact(&mut existing).await?;
            if existing[..4] != MAGIC[..] {
                return Err(Error::Corruption(format!(
                    "{} has an unknown header",
                    path.display()
                )));
            }
            let version = u32::from_le_bytes([existing[4], existing[5], existing[6], existing[7]]);
            if version != FORMAT_VERSION {
                return Err(Error::Conflict(format!(
                    "{} has format version {}, expected {}",
                    path.display(),
                    version,
                    FORMAT_VERSION
                )));
            }

            let frames = scan(&mut file, len).await?;
            if frames.end < len {
                warn!(
                    valid_versions = frames.offsets.len(),
                    discarded_bytes = len - frames.end,
                    "truncating change log after interrupted append"
                );
                file.set_len(frames.end).await?;
                file.sync_all().await?;
            }

            frames
        };

        info!(versions = frames.offsets.len(), "opened change log");

        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(file),
            frames: Arc::new(RwLock::new(frames)),
        })
    }
}

/// Validates all frames following the header, stopping before a damaged
/// final frame.
async fn scan(file: &mut File, len: u64) -> Result<Frames, Error> {
    let mut reader = BufReader::new(file);
    let mut frames = Frames {
        offsets: vec![],
        end: HEADER_LEN,
    };

    loop {
        let pos = frames.end;
        if pos == len {
            break;
        }

        if len - pos < FRAME_HEADER_LEN {
            warn!(offset = pos, "incomplete frame header at end of log");
            break;
        }

        let mut frame_header = [0u8; FRAME_HEADER_LEN as usize];
        reader.read_exact(&mut frame_header).await?;
        let (size, crc) = parse_frame_header(&frame_header);

        let expected_version = frames.offsets.len() as u64 + 1;

        let end = pos + FRAME_HEADER_LEN + size as u64;
        if end > len {
            // An interrupted append leaves a prefix of one frame, nothing
            // valid can follow it. Otherwise the length itself is damaged.
            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await?;
            if let Some(at) = find_later_frame(&rest, expected_version) {
                return Err(Error::Corruption(format!(
                    "frame at offset {} claims {} bytes, but a valid frame follows at offset {}",
                    pos,
                    size,
                    pos + FRAME_HEADER_LEN + at as u64
                )));
            }

            warn!(offset = pos, size, "incomplete frame at end of log");
            break;
        }

        let mut payload = vec![0u8; size as usize];
        reader.read_exact(&mut payload).await?;

        let res = decode_frame(&payload, crc).and_then(|change_set| {
            if change_set.version != expected_version {
                return Err(Error::Corruption(format!(
                    "expected version {}, found {}",
                    expected_version, change_set.version
                )));
            }
            Ok(change_set)
        });

        match res {
            Ok(_) => {
                frames.offsets.push(pos);
                frames.end = end;
            }
            Err(e) if end == len => {
                warn!(offset = pos, err = %e, "invalid final frame");
                break;
            }
            Err(e) => {
                return Err(Error::Corruption(format!(
                    "frame at offset {}: {}",
                    pos, e
                )))
            }
        }
    }

    Ok(frames)
}

/// The offset in `data` of the first complete, valid frame of a version
/// above `version`.
fn find_later_frame(data: &[u8], version: u64) -> Option<usize> {
    let header_len = FRAME_HEADER_LEN as usize;
    (0..data.len().saturating_sub(header_len)).find(|&start| {
        let mut frame_header = [0u8; FRAME_HEADER_LEN as usize];
        frame_header.copy_from_slice(&data[start..start + header_len]);
        let (size, crc) = parse_frame_header(&frame_header);

        let payload_start = start + header_len;
        let Some(payload) = data.get(payload_start..payload_start + size as usize) else {
            return false;
        };
        size > 0
            && matches!(decode_frame(payload, crc), Ok(change_set) if change_set.version > version)
    })
}

#[async_trait]
impl ChangeLog for FileChangeLog {
    #[instrument(skip_all, err, fields(change_set.version = change_set.version))]
    async fn append(&self, change_set: &ChangeSet) -> Result<(), Error> {
        let mut file = self.writer.lock().await;

        let (current, end) = {
            let frames = self.frames.read();
            (frames.offsets.len() as u64, frames.end)
        };
        super::check_next_version(current, change_set)?;

        let frame = encode_frame(change_set)?;

        let res = async {
            file.seek(SeekFrom::Start(end)).await?;
            file.write_all(&frame).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = res {
            // Don't leave a partial frame for the next append to write behind.
            if let Err(e) = file.set_len(end).await {
                warn!(err = %e, "unable to cut off partially written frame");
            }
            return Err(e.into());
        }

        let mut frames = self.frames.write();
        frames.offsets.push(end);
        frames.end = end + frame.len() as u64;
        debug!(offset = end, size = frame.len(), "appended frame");

        Ok(())
    }

    fn read_from(&self, version: u64) -> BoxStream<'static, Result<ChangeSet, Error>> {
        let first = version.max(1);
        let (start, last) = {
            let frames = self.frames.read();
            match frames.offsets.get(first as usize - 1) {
                Some(start) => (*start, frames.offsets.len() as u64),
                None => return stream::empty().boxed(),
            }
        };

        let path = self.path.clone();

        Box::pin(try_stream! {
            let mut file = File::open(&path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            let mut reader = BufReader::new(file);

            for expected_version in first..=last {
                let mut frame_header = [0u8; FRAME_HEADER_LEN as usize];
                reader.read_exact(&mut frame_header).await?;
                let (size, crc) = parse_frame_header(&frame_header);

                let mut payload = vec![0u8; size as usize];
                reader.read_exact(&mut payload).await?;

                let change_set = decode_frame(&payload, crc)?;
                if change_set.version != expected_version {
                    Err(Error::Corruption(format!(
                        "expected version {}, found {}",
                        expected_version, change_set.version
                    )))?;
                }

                yield change_set;
            }
        })
    }

    fn current_version(&self) -> u64 {
        self.frames.read().offsets.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::{FileChangeLog, HEADER_LEN};
    use crate::changelog::ChangeLog;
    use crate::changes::{ChangeRecord, ChangeSet, CreateKind};
    use crate::content::Content;
    use crate::Error;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use std::path::Path;

    fn change_set(version: u64) -> ChangeSet {
        ChangeSet {
            version,
            timestamp: version,
            name: None,
            records: vec![ChangeRecord::Create {
                id: version,
                parent: 0,
                name: format!("file-{}", version).as_str().try_into().unwrap(),
                kind: CreateKind::File(Content::Inline(Bytes::from(vec![version as u8; 16]))),
            }],
        }
    }

    /// Appends `n` change sets and returns the file length after each of them.
    async fn populate(path: &Path, n: u64) -> Vec<u64> {
        let log = FileChangeLog::open(path).await.expect("must open");
        let mut lens = vec![];
        for v in 1..=n {
            log.append(&change_set(v)).await.expect("must append");
            lens.push(std::fs::metadata(path).unwrap().len());
        }
        lens
    }

    async fn versions(log: &FileChangeLog) -> Vec<u64> {
        log.read_from(1)
            .map_ok(|cs| cs.version)
            .try_collect()
            .await
            .expect("must read")
    }

    #[tokio::test]
    async fn new_file_gets_header() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");

        let log = FileChangeLog::open(&path).await.expect("must open");
        assert_eq!(0, log.current_version());
        assert_eq!(HEADER_LEN, std::fs::metadata(&path).unwrap().len());
        assert_eq!(b"LHCL", &std::fs::read(&path).unwrap()[..4]);
    }

    #[tokio::test]
    async fn reopen() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        populate(&path, 3).await;

        let log = FileChangeLog::open(&path).await.expect("must open");
        assert_eq!(3, log.current_version());
        assert_eq!(vec![1, 2, 3], versions(&log).await);

        let cs: Vec<ChangeSet> = log.read_from(2).try_collect().await.unwrap();
        assert_eq!(vec![change_set(2), change_set(3)], cs);
    }

    #[tokio::test]
    async fn truncated_trailing_frame() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 3).await;

        // cut the last frame in half
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(lens[1] + 5).unwrap();

        let log = FileChangeLog::open(&path).await.expect("must recover");
        assert_eq!(2, log.current_version());
        assert_eq!(lens[1], std::fs::metadata(&path).unwrap().len());

        // appending continues where the valid data ended
        log.append(&change_set(3)).await.expect("must append");
        drop(log);
        let log = FileChangeLog::open(&path).await.unwrap();
        assert_eq!(vec![1, 2, 3], versions(&log).await);
    }

    #[tokio::test]
    async fn partial_frame_header() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 1).await;

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[1, 2, 3]);
        std::fs::write(&path, data).unwrap();

        let log = FileChangeLog::open(&path).await.expect("must recover");
        assert_eq!(1, log.current_version());
        assert_eq!(lens[0], std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn invalid_final_frame() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 2).await;

        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let log = FileChangeLog::open(&path).await.expect("must recover");
        assert_eq!(1, log.current_version());
        assert_eq!(lens[0], std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn corrupted_middle_frame() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 3).await;

        // flip a payload byte of the second frame
        let mut data = std::fs::read(&path).unwrap();
        data[lens[0] as usize + 10] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            FileChangeLog::open(&path).await,
            Err(Error::Corruption(_))
        ));

        // nothing was repaired
        assert_eq!(data, std::fs::read(&path).unwrap());
    }

    #[tokio::test]
    async fn corrupted_frame_length() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 3).await;

        // the second frame now claims to run past the end of the file
        let mut data = std::fs::read(&path).unwrap();
        data[lens[0] as usize + 3] ^= 0x01;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            FileChangeLog::open(&path).await,
            Err(Error::Corruption(_))
        ));
        assert_eq!(data, std::fs::read(&path).unwrap());
    }

    #[tokio::test]
    async fn oversized_final_frame_length() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        let lens = populate(&path, 2).await;

        // nothing valid follows the last frame, so it is a torn append
        let mut data = std::fs::read(&path).unwrap();
        data[lens[0] as usize + 3] ^= 0x01;
        std::fs::write(&path, &data).unwrap();

        let log = FileChangeLog::open(&path).await.expect("must recover");
        assert_eq!(1, log.current_version());
        assert_eq!(lens[0], std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn bad_header() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        std::fs::write(&path, b"NOTALOG!and some more").unwrap();

        assert!(matches!(
            FileChangeLog::open(&path).await,
            Err(Error::Corruption(_))
        ));
    }

    #[tokio::test]
    async fn other_format_version() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let path = tmpdir.path().join("changes.log");
        populate(&path, 1).await;

        let mut data = std::fs::read(&path).unwrap();
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            FileChangeLog::open(&path).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(data, std::fs::read(&path).unwrap());
    }
}
