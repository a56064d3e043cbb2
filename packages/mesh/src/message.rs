//! The tunnel message taxonomy and frame codec.
//!
//! Frames are length-delimited and self-describing: a one-byte kind
//! discriminator followed by the inflated payload length and the
//! compressed, archived payload. Changing any of this bumps
//! [`crate::peer::CURRENT_PEERVERSION`].

use std::{collections::BTreeMap, path::PathBuf};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use jiff::Timestamp;
use strum::{Display, FromRepr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    archive::{self, Archivable, Archive, ArchiveReader, ArchiveWriter},
    compress::Codec,
};

/// Batched message types accumulate until their payload reaches this size,
/// amortizing per-frame overhead without adding more than one message of
/// latency.
pub const BATCH_LIMIT: usize = 4 * 1024;

/// Hard ceiling on a single frame, compressed.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The closed set of remote task outcomes.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum RemoteError {
    /// The task ran to completion.
    #[default]
    NoError = 0,
    /// The worker hit an unexpected internal failure.
    Internal = 1,
    /// The task ran and exited non-zero; the exit code is meaningful.
    Process = 2,
    /// The worker had no resources; try another peer.
    Refused = 3,
    /// The operation timed out.
    Timeout = 4,
}

impl RemoteError {
    /// Whether the caller should immediately try another peer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RemoteError::Refused)
    }

    /// Whether the caller should retry within the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Timeout | RemoteError::Internal)
    }
}

impl Archivable for RemoteError {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        let mut byte = *self as u8;
        ar.u8(&mut byte)?;
        *self = RemoteError::from_repr(byte)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown remote error code: {byte}"))?;
        Ok(())
    }
}

/// Message kind discriminator, written at the head of every frame.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, FromRepr)]
#[repr(u8)]
pub enum Kind {
    Ping = 1,
    Pong = 2,
    TaskDispatch = 3,
    TaskStart = 4,
    TaskFileAccess = 5,
    TaskOutput = 6,
    TaskStop = 7,
    Goodbye = 8,
}

/// A mapping from a client-local absolute path prefix to the URL prefix the
/// worker fetches it from.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct MountPoint {
    pub path: PathBuf,
    pub url_prefix: String,
}

impl Archivable for MountPoint {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        self.url_prefix.archive(ar)
    }
}

/// The command a worker is asked to run.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct TaskDispatch {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    /// Translation table for paths that only exist on the client.
    pub mounts: Vec<MountPoint>,
    /// The minimum input set a worker without IO detouring must stage
    /// before spawning the process.
    pub inputs: Vec<PathBuf>,
    pub use_response_file: bool,
}

impl Archivable for TaskDispatch {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.executable.archive(ar)?;
        self.arguments.archive(ar)?;
        self.environment.archive(ar)?;
        self.working_dir.archive(ar)?;
        self.mounts.archive(ar)?;
        self.inputs.archive(ar)?;
        ar.bool(&mut self.use_response_file)
    }
}

/// One file the dispatched process touched.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct FileAccess {
    pub path: PathBuf,
    /// False for reads, true for writes.
    pub write: bool,
}

impl Archivable for FileAccess {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.path.archive(ar)?;
        ar.bool(&mut self.write)
    }
}

/// One line of captured process output.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct OutputLine {
    /// False for stdout, true for stderr.
    pub stderr: bool,
    pub line: String,
}

impl Archivable for OutputLine {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        ar.bool(&mut self.stderr)?;
        self.line.archive(ar)
    }
}

/// A tunnel message.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    /// Keep-alive and latency probe.
    Ping { timestamp: Timestamp },
    /// Echo of a ping's timestamp.
    Pong { timestamp: Timestamp },
    /// Client asks the worker to run a command.
    Dispatch(TaskDispatch),
    /// Worker accepts (`NoError`) or rejects (`Refused` / `Internal`).
    Start { code: RemoteError },
    /// Batched file-access records from the running task.
    FileAccess { records: Vec<FileAccess> },
    /// Batched output lines from the running task.
    Output { lines: Vec<OutputLine> },
    /// Task completion.
    Stop { exit_code: i32, code: RemoteError },
    /// Orderly tunnel close.
    Goodbye,
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Ping { .. } => Kind::Ping,
            Message::Pong { .. } => Kind::Pong,
            Message::Dispatch(_) => Kind::TaskDispatch,
            Message::Start { .. } => Kind::TaskStart,
            Message::FileAccess { .. } => Kind::TaskFileAccess,
            Message::Output { .. } => Kind::TaskOutput,
            Message::Stop { .. } => Kind::TaskStop,
            Message::Goodbye => Kind::Goodbye,
        }
    }

    fn archive_payload(&mut self, ar: &mut dyn Archive) -> Result<()> {
        match self {
            Message::Ping { timestamp } | Message::Pong { timestamp } => timestamp.archive(ar),
            Message::Dispatch(dispatch) => dispatch.archive(ar),
            Message::Start { code } => code.archive(ar),
            Message::FileAccess { records } => records.archive(ar),
            Message::Output { lines } => lines.archive(ar),
            Message::Stop { exit_code, code } => {
                ar.i32(exit_code)?;
                code.archive(ar)
            }
            Message::Goodbye => Ok(()),
        }
    }

    fn empty(kind: Kind) -> Message {
        match kind {
            Kind::Ping => Message::Ping {
                timestamp: Timestamp::default(),
            },
            Kind::Pong => Message::Pong {
                timestamp: Timestamp::default(),
            },
            Kind::TaskDispatch => Message::Dispatch(TaskDispatch::default()),
            Kind::TaskStart => Message::Start {
                code: RemoteError::default(),
            },
            Kind::TaskFileAccess => Message::FileAccess {
                records: Vec::new(),
            },
            Kind::TaskOutput => Message::Output { lines: Vec::new() },
            Kind::TaskStop => Message::Stop {
                exit_code: 0,
                code: RemoteError::default(),
            },
            Kind::Goodbye => Message::Goodbye,
        }
    }

    /// Encode the message into a complete frame.
    pub fn encode(&mut self, codec: &Codec) -> Result<Vec<u8>> {
        let mut payload = ArchiveWriter::buffer();
        self.archive_payload(&mut payload)
            .with_context(|| format!("archive {} payload", self.kind()))?;
        let payload = payload.into_bytes();
        let compressed = codec.compress(&payload)?;

        let body_len = u32::try_from(1 + 4 + compressed.len()).context("frame too large")?;
        if body_len > MAX_FRAME_LEN {
            bail!("frame length {body_len} exceeds limit");
        }
        let mut frame = Vec::with_capacity(4 + body_len as usize);
        frame.extend_from_slice(&body_len.to_le_bytes());
        frame.push(self.kind() as u8);
        frame.extend_from_slice(&(u32::try_from(payload.len()).context("payload too large")?).to_le_bytes());
        frame.extend_from_slice(&compressed);
        Ok(frame)
    }

    /// Decode a message from a frame body (everything after the length
    /// prefix).
    pub fn decode(body: &[u8], codec: &Codec) -> Result<Message> {
        if body.len() < 5 {
            bail!("frame body too short: {} bytes", body.len());
        }
        let kind = Kind::from_repr(body[0])
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown message discriminator: {}", body[0]))?;
        let inflated_len = u32::from_le_bytes(body[1..5].try_into().expect("sliced 4 bytes"));
        let payload = codec.decompress(&body[5..], inflated_len as usize)?;

        let mut message = Message::empty(kind);
        let mut ar = ArchiveReader::buffer(&payload);
        message
            .archive_payload(&mut ar)
            .with_context(|| format!("decode {kind} payload"))?;
        Ok(message)
    }

    /// Approximate archived payload size, used for batching decisions.
    pub fn payload_len(&mut self) -> usize {
        archive::to_bytes(&mut Probe(self)).map(|b| b.len()).unwrap_or(0)
    }
}

/// Adapter so `payload_len` can reuse the payload traversal.
struct Probe<'a>(&'a mut Message);

impl Archivable for Probe<'_> {
    fn archive(&mut self, ar: &mut dyn Archive) -> Result<()> {
        self.0.archive_payload(ar)
    }
}

/// Write one message as a frame.
pub async fn write_frame<W>(writer: &mut W, message: &mut Message, codec: &Codec) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode(codec)?;
    writer
        .write_all(&frame)
        .await
        .with_context(|| format!("write {} frame", message.kind()))?;
    Ok(frame.len())
}

/// Read one message frame.
pub async fn read_frame<R>(reader: &mut R, codec: &Codec) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await.context("read frame length")?;
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds limit");
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.context("read frame body")?;
    Message::decode(&body, codec)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::compress::Format;

    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::Ping {
                timestamp: Timestamp::new(1_700_000_000, 123).expect("timestamp"),
            },
            Message::Pong {
                timestamp: Timestamp::new(1_700_000_001, 456).expect("timestamp"),
            },
            Message::Dispatch(TaskDispatch {
                executable: PathBuf::from("/usr/bin/cc"),
                arguments: vec!["-O2".into(), "-c".into(), "foo.c".into()],
                environment: BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]),
                working_dir: PathBuf::from("/work"),
                mounts: vec![MountPoint {
                    path: PathBuf::from("/work/src"),
                    url_prefix: "http://client:8080/src".into(),
                }],
                inputs: vec![PathBuf::from("/work/src/foo.c")],
                use_response_file: true,
            }),
            Message::Start {
                code: RemoteError::Refused,
            },
            Message::FileAccess {
                records: vec![
                    FileAccess {
                        path: PathBuf::from("/work/src/foo.c"),
                        write: false,
                    },
                    FileAccess {
                        path: PathBuf::from("/work/out/foo.o"),
                        write: true,
                    },
                ],
            },
            Message::Output {
                lines: vec![OutputLine {
                    stderr: true,
                    line: "foo.c:1: warning: unused variable".into(),
                }],
            },
            Message::Stop {
                exit_code: 2,
                code: RemoteError::Process,
            },
            Message::Goodbye,
        ]
    }

    #[test]
    fn frame_round_trip_every_kind() -> Result<()> {
        for format in [Format::Zstd, Format::Lz4] {
            let codec = Codec::new(format);
            for mut message in samples() {
                let frame = message.encode(&codec)?;
                let decoded = Message::decode(&frame[4..], &codec)?;
                assert_eq!(message, decoded, "{} over {format}", message.kind());
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn async_frame_round_trip() -> Result<()> {
        let codec = Codec::new(Format::Zstd);
        let mut cursor = std::io::Cursor::new(Vec::new());
        for mut message in samples() {
            write_frame(&mut cursor, &mut message, &codec).await?;
        }
        cursor.set_position(0);
        for expected in samples() {
            let decoded = read_frame(&mut cursor, &codec).await?;
            assert_eq!(expected, decoded);
        }
        Ok(())
    }

    #[test]
    fn unknown_discriminator_is_error() {
        let codec = Codec::new(Format::Zstd);
        let body = [99u8, 0, 0, 0, 0];
        assert!(Message::decode(&body, &codec).is_err());
    }
}
