//! Tag multiplexed 9P connection.
//!
//! One task owns the read half and routes every reply to the caller waiting
//! on its tag. Another owns the write half and drains a bounded queue of
//! encoded frames, so each frame reaches the wire whole.

use {
    crate::{
        error::{self, Error},
        fcall::*,
        fid::FidPool,
        io_err, res, serialize,
        utils::{self, Result},
    },
    bytes::{Bytes, BytesMut, buf::BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, UnixStream},
        sync::{mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{
        FramedRead, FramedWrite,
        length_delimited::{self, LengthDelimitedCodec},
    },
};

/// Requested maximum message size, as the Plan 9 Go client asks for.
pub const DEFAULT_MSIZE: u32 = 131072;

/// Frames waiting for the writer task.
const WRITE_QUEUE: usize = 64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection parameters.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum message size offered in `TVersion`.
    pub msize: u32,
    /// Protocol version offered in `TVersion`.
    pub version: String,
    /// Per-request deadline. Expiry tears the whole connection down.
    pub timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            msize: DEFAULT_MSIZE,
            version: P92000.to_owned(),
            timeout: None,
        }
    }
}

impl Config {
    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

fn codec() -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(SIZE_FIELD_LEN)
        .length_adjustment(-(SIZE_FIELD_LEN as isize))
        .little_endian();
    builder
}

fn encode_body(msg: &Msg) -> std::io::Result<Bytes> {
    let mut writer = BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut writer, msg)?;
    Ok(writer.into_inner().freeze())
}

struct Pending {
    expect: MsgType,
    reply: oneshot::Sender<Result<FCall>>,
}

struct TagTable {
    pending: HashMap<u16, Pending>,
    next: u16,
    closed: Option<Error>,
}

struct Shared {
    tags: parking_lot::Mutex<TagTable>,
    /// Dropped on teardown, which lets the writer drain and shut down.
    outbox: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    writer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    fids: FidPool,
    msize: u32,
    timeout: Option<Duration>,
}

impl Shared {
    fn register(&self, expect: MsgType, reply: oneshot::Sender<Result<FCall>>) -> Result<u16> {
        let mut t = self.tags.lock();
        if t.closed.is_some() {
            return Err(Error::ConnectionClosed);
        }
        if t.pending.len() >= NOTAG as usize {
            return Err(Error::TagsExhausted);
        }

        loop {
            let tag = t.next;
            t.next = t.next.wrapping_add(1);
            if t.next == NOTAG {
                t.next = 0;
            }
            if !t.pending.contains_key(&tag) {
                t.pending.insert(tag, Pending { expect, reply });
                return Ok(tag);
            }
        }
    }

    fn unregister(&self, tag: u16) {
        self.tags.lock().pending.remove(&tag);
    }

    /// Route one received frame body to its waiter.
    fn dispatch(&self, frame: &[u8]) -> Result<()> {
        let size = frame.len() + SIZE_FIELD_LEN;
        if size > self.msize as usize {
            return Err(Error::MalformedMessage(format!(
                "frame of {} bytes exceeds msize {}",
                size, self.msize
            )));
        }

        let msg = serialize::read_body(frame).map_err(error::from_codec)?;
        debug!("\t← {:?}", msg);

        let typ = MsgType::from(&msg.body);
        if typ.is_t() {
            return Err(Error::ProtocolViolation(format!(
                "server sent request {:?}",
                typ
            )));
        }

        let pending = self.tags.lock().pending.remove(&msg.tag).ok_or_else(|| {
            Error::ProtocolViolation(format!("{:?} for unknown tag {}", typ, msg.tag))
        })?;

        let reply = match msg.body {
            FCall::RError { ename } => Err(Error::ServerRejected(ename)),
            body if typ == pending.expect => Ok(body),
            _ => {
                let _ = pending.reply.send(Err(Error::ConnectionClosed));
                return Err(Error::unexpected(pending.expect, typ));
            }
        };

        // The caller may have stopped waiting; its tag is free either way.
        let _ = pending.reply.send(reply);
        Ok(())
    }

    /// Close the connection for good and fail every waiter.
    fn teardown(&self, cause: Error) {
        let pending = {
            let mut t = self.tags.lock();
            if t.closed.is_some() {
                return;
            }
            t.closed = Some(cause.clone());
            std::mem::take(&mut t.pending)
        };

        match cause {
            Error::ConnectionClosed => info!("connection closed"),
            ref e => error!("connection torn down: {}", e),
        }

        self.fids.abort_on_disconnect();
        self.outbox.lock().take();
        for (_, p) in pending {
            let _ = p.reply.send(Err(Error::ConnectionClosed));
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut framedread: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Send + Unpin,
{
    let cause = loop {
        let bytes = match framedread.next().await {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => break error::from_codec(e),
            None => break Error::ConnectionClosed,
        };
        if let Err(e) = shared.dispatch(&bytes) {
            break e;
        }
    };

    shared.teardown(cause);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut outbox: mpsc::Receiver<Bytes>,
    mut framedwrite: FramedWrite<BoxedWriter, LengthDelimitedCodec>,
) {
    while let Some(bytes) = outbox.recv().await {
        if let Err(e) = framedwrite.send(bytes).await {
            shared.teardown(Error::from(e));
            return;
        }
    }

    // Every sender is gone: the connection was torn down.
    if let Err(e) = SinkExt::<Bytes>::close(&mut framedwrite).await {
        debug!("closing writer: {}", e);
    }
}

async fn handshake<R>(
    framedread: &mut FramedRead<R, LengthDelimitedCodec>,
    framedwrite: &mut FramedWrite<BoxedWriter, LengthDelimitedCodec>,
    config: &Config,
) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let tversion = Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize: config.msize,
            version: config.version.clone(),
        },
    };
    debug!("\t→ {:?}", tversion);
    framedwrite.send(encode_body(&tversion)?).await?;

    let frame = match framedread.next().await {
        Some(frame) => frame.map_err(error::from_codec)?,
        None => return Err(Error::ConnectionClosed),
    };
    let rversion = serialize::read_body(&frame).map_err(error::from_codec)?;
    debug!("\t← {:?}", rversion);

    let (msize, version) = match rversion {
        Msg {
            tag: NOTAG,
            body: FCall::RVersion { msize, version },
        } => (msize, version),
        Msg {
            body: FCall::RError { ename },
            ..
        } => return Err(Error::ServerRejected(ename)),
        other => return Err(Error::unexpected(MsgType::RVersion, other)),
    };

    if version != config.version {
        return Err(Error::UnsupportedVersion(version));
    }
    if msize > config.msize || msize <= IOHDRSZ {
        return Err(Error::ProtocolViolation(format!(
            "server msize {} outside (IOHDRSZ, {}]",
            msize, config.msize
        )));
    }
    Ok(msize)
}

struct CloseOnDrop(Arc<Shared>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.teardown(Error::ConnectionClosed);
    }
}

/// A 9P client connection.
///
/// Clones share the connection. It closes when [`Conn::close`] is called,
/// when the stream fails, or when the last clone is dropped.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
    _guard: Arc<CloseOnDrop>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("msize", &self.shared.msize)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Conn {
    /// Negotiate the version over an established stream and start the reader.
    pub async fn new<R, W>(reader: R, writer: W, config: Config) -> Result<Conn>
    where
        R: 'static + AsyncRead + Send + Unpin,
        W: 'static + AsyncWrite + Send + Unpin,
    {
        let mut framedread = codec()
            .max_frame_length(config.msize as usize)
            .new_read(reader);
        let mut framedwrite = codec().new_write(Box::new(writer) as BoxedWriter);

        let negotiate = handshake(&mut framedread, &mut framedwrite, &config);
        let msize = match config.timeout {
            Some(timeout) => tokio::time::timeout(timeout, negotiate)
                .await
                .map_err(|_| Error::TimedOut)??,
            None => negotiate.await?,
        };
        framedread
            .decoder_mut()
            .set_max_frame_length(msize as usize);
        info!("negotiated {} with msize {}", config.version, msize);

        let (outbox, queued) = mpsc::channel(WRITE_QUEUE);
        let shared = Arc::new(Shared {
            tags: parking_lot::Mutex::new(TagTable {
                pending: HashMap::new(),
                next: 0,
                closed: None,
            }),
            outbox: parking_lot::Mutex::new(Some(outbox)),
            reader: parking_lot::Mutex::new(None),
            writer: parking_lot::Mutex::new(None),
            fids: FidPool::new(),
            msize,
            timeout: config.timeout,
        });

        let writer = tokio::spawn(write_loop(shared.clone(), queued, framedwrite));
        *shared.writer.lock() = Some(writer);
        let reader = tokio::spawn(read_loop(shared.clone(), framedread));
        *shared.reader.lock() = Some(reader);

        Ok(Conn {
            _guard: Arc::new(CloseOnDrop(shared.clone())),
            shared,
        })
    }

    /// Send one request and wait for its reply.
    ///
    /// `RError` replies come back as [`Error::ServerRejected`].
    pub async fn rpc(&self, body: FCall) -> Result<FCall> {
        match self.shared.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.call(body)).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.shared.teardown(Error::TimedOut);
                    Err(Error::TimedOut)
                }
            },
            None => self.call(body).await,
        }
    }

    async fn call(&self, body: FCall) -> Result<FCall> {
        let typ = MsgType::from(&body);
        let expect = typ
            .response()
            .ok_or_else(|| Error::BadRequest(format!("{:?} is not a request", typ)))?;

        let outbox = self
            .shared
            .outbox
            .lock()
            .clone()
            .ok_or(Error::ConnectionClosed)?;
        // No await from here until the frame is queued, so a dropped call
        // cannot leave a tag registered for a request that was never sent.
        let permit = outbox
            .reserve()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let (tx, rx) = oneshot::channel();
        let tag = self.shared.register(expect, tx)?;
        let msg = Msg { tag, body };

        let bytes = match encode_body(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.shared.unregister(tag);
                return Err(Error::BadRequest(e.to_string()));
            }
        };
        let size = bytes.len() + SIZE_FIELD_LEN;
        if size > self.shared.msize as usize {
            self.shared.unregister(tag);
            return Err(Error::MessageTooLarge {
                size,
                max: self.shared.msize as usize,
            });
        }

        debug!("\t→ {:?}", msg);
        permit.send(bytes);
        drop(outbox);

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Tear the connection down. Every pending and later call fails.
    ///
    /// Returns once frames already queued are written and the stream is shut down.
    pub async fn close(&self) {
        self.shared.teardown(Error::ConnectionClosed);
        let writer = self.shared.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                debug!("writer task: {}", e);
            }
        }
    }

    /// Tear the connection down because of `cause`, and hand it back.
    pub(crate) fn fail(&self, cause: Error) -> Error {
        self.shared.teardown(cause.clone());
        cause
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tags.lock().closed.is_some()
    }

    /// The error that closed the connection, if it is closed.
    pub fn close_reason(&self) -> Option<Error> {
        self.shared.tags.lock().closed.clone()
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.shared.msize
    }

    /// Number of requests waiting for a reply.
    pub fn pending(&self) -> usize {
        self.shared.tags.lock().pending.len()
    }

    pub fn fids(&self) -> &FidPool {
        &self.shared.fids
    }
}

/// Connect to a server given a `proto!address!port` dial string.
///
/// # Example
/// ```no_run
/// # async fn run() -> rs9p_client::Result<()> {
/// use rs9p_client::{Config, dial, om};
///
/// let conn = dial("tcp!127.0.0.1!564", Config::default()).await?;
/// let fsys = conn.attach("glenda", "").await?;
/// let file = fsys.open("lib/profile", om::READ).await?;
/// let text = file.read_to_end().await?;
/// file.close().await?;
/// # Ok(())
/// # }
/// ```
pub async fn dial(addr: &str, config: Config) -> Result<Conn> {
    let (proto, addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            let (readhalf, writehalf) = stream.into_split();
            Conn::new(readhalf, writehalf, config).await
        }
        "unix" => {
            let stream = UnixStream::connect(&addr).await?;
            let (readhalf, writehalf) = stream.into_split();
            Conn::new(readhalf, writehalf, config).await
        }
        _ => res!(io_err!(InvalidInput, "Protocol not supported")),
    }
}
