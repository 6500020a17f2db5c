#![allow(dead_code)]
//! In-process 9P servers for driving a real `Conn` over a duplex pipe.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut, buf::BufMut};
use futures::sink::SinkExt;
use parking_lot::Mutex;
use rs9p_client::{serialize, *};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::codec::{LengthDelimitedCodec, length_delimited};

pub fn codec() -> length_delimited::Builder {
    let mut builder = LengthDelimitedCodec::builder();
    builder
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian();
    builder
}

pub fn body(msg: &Msg) -> Bytes {
    let mut writer = BytesMut::with_capacity(4096).writer();
    serialize::write_msg(&mut writer, msg).unwrap();
    writer.into_inner().freeze()
}

/// Stable qid for a walked name, so callers can check which walk got which reply.
pub fn qid_for(name: &str) -> QId {
    let path = name
        .bytes()
        .fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3));
    let typ = if name == "/" || name.starts_with("dir") {
        QIdType::DIR
    } else {
        QIdType::FILE
    };
    QId {
        typ,
        version: 0,
        path,
    }
}

pub fn content_for(name: &str) -> Vec<u8> {
    match name {
        "big" | "widebig" => (0..100_000u32).map(|i| (i % 251) as u8).collect(),
        _ => format!("contents of {}\n", name).into_bytes(),
    }
}

/// A 9P proxy in the manner of 9pserve: fids enter its table on walk and
/// leave only when the delayed back end answers the clunk.
///
/// Names steer its behaviour:
/// - `missing*` stops a walk at that element
/// - `slow*` as the first walk name delays the reply by 20ms
/// - `locked` rejects open and remove
/// - `full` accepts zero bytes per write
/// - `wide*` opens with an iounit as large as msize
pub struct Proxy {
    pub msize: u32,
    pub clunk_delay: Duration,
    pub fids: Mutex<HashMap<u32, String>>,
    pub written: Mutex<HashMap<String, Vec<u8>>>,
    pub duplicates: AtomicUsize,
    pub clunks: watch::Sender<usize>,
}

impl Proxy {
    pub fn new(clunk_delay: Duration) -> Arc<Proxy> {
        Arc::new(Proxy {
            msize: 8192,
            clunk_delay,
            fids: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
            duplicates: AtomicUsize::new(0),
            clunks: watch::channel(0).0,
        })
    }

    pub fn holds(&self, fid: u32) -> bool {
        self.fids.lock().contains_key(&fid)
    }

    pub async fn serve(self: Arc<Self>, stream: DuplexStream) {
        let (readhalf, writehalf) = tokio::io::split(stream);
        let mut framedread = codec().new_read(readhalf);
        let mut framedwrite = codec().new_write(writehalf);

        // Replies go through one sender task so slow handlers never block reading.
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if framedwrite.send(body(&msg)).await.is_err() {
                    return;
                }
            }
        });

        while let Some(Ok(bytes)) = framedread.next().await {
            let msg = match serialize::read_body(&bytes) {
                Ok(msg) => msg,
                Err(_) => return,
            };
            self.clone().handle(msg, tx.clone());
        }
    }

    fn name_of(&self, fid: u32) -> Option<String> {
        self.fids.lock().get(&fid).cloned()
    }

    fn handle(self: Arc<Self>, msg: Msg, tx: mpsc::UnboundedSender<Msg>) {
        let tag = msg.tag;
        let reply = move |body: FCall| {
            let _ = tx.send(Msg { tag, body });
        };
        let error = |ename: &str| FCall::RError {
            ename: ename.to_owned(),
        };

        match msg.body {
            FCall::TVersion { msize, version } => reply(FCall::RVersion {
                msize: msize.min(self.msize),
                version,
            }),

            FCall::TAttach { fid, .. } => {
                self.fids.lock().insert(fid, "/".to_owned());
                reply(FCall::RAttach { qid: qid_for("/") })
            }

            FCall::TWalk {
                fid,
                newfid,
                wnames,
            } => {
                let response = {
                    let mut fids = self.fids.lock();
                    match fids.get(&fid).cloned() {
                        None => error("unknown fid"),
                        Some(_) if newfid != fid && fids.contains_key(&newfid) => {
                            self.duplicates.fetch_add(1, Ordering::SeqCst);
                            error("duplicate fid")
                        }
                        Some(parent) => {
                            let wqids: Vec<QId> = wnames
                                .iter()
                                .take_while(|n| !n.starts_with("missing"))
                                .map(|n| qid_for(n))
                                .collect();
                            if wqids.len() == wnames.len() {
                                let name = wnames.last().cloned().unwrap_or(parent);
                                fids.insert(newfid, name);
                                FCall::RWalk { wqids }
                            } else if wqids.is_empty() {
                                error("file does not exist")
                            } else {
                                FCall::RWalk { wqids }
                            }
                        }
                    }
                };

                if wnames.first().is_some_and(|n| n.starts_with("slow")) {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        reply(response);
                    });
                } else {
                    reply(response);
                }
            }

            FCall::TOpen { fid, .. } => match self.name_of(fid) {
                None => reply(error("unknown fid")),
                Some(name) if name == "locked" => reply(error("permission denied")),
                Some(name) => reply(FCall::ROpen {
                    qid: qid_for(&name),
                    iounit: if name.starts_with("wide") { self.msize } else { 0 },
                }),
            },

            FCall::TCreate { fid, name, .. } => {
                self.fids.lock().insert(fid, name.clone());
                reply(FCall::RCreate {
                    qid: qid_for(&name),
                    iounit: 0,
                })
            }

            FCall::TRead { fid, offset, count } => match self.name_of(fid) {
                None => reply(error("unknown fid")),
                Some(name) => {
                    let content = content_for(&name);
                    let start = (offset as usize).min(content.len());
                    let end = (start + count as usize).min(content.len());
                    reply(FCall::RRead {
                        data: Data(content[start..end].to_vec()),
                    })
                }
            },

            FCall::TWrite { fid, offset, data } => match self.name_of(fid) {
                None => reply(error("unknown fid")),
                Some(name) if name == "full" => reply(FCall::RWrite { count: 0 }),
                Some(name) => {
                    let mut written = self.written.lock();
                    let file = written.entry(name).or_default();
                    let end = offset as usize + data.0.len();
                    if file.len() < end {
                        file.resize(end, 0);
                    }
                    file[offset as usize..end].copy_from_slice(&data.0);
                    reply(FCall::RWrite {
                        count: data.0.len() as u32,
                    })
                }
            },

            FCall::TClunk { fid } => {
                self.clunks.send_modify(|n| *n += 1);
                // Keep the fid in the table until the back end would have replied.
                tokio::spawn(async move {
                    tokio::time::sleep(self.clunk_delay).await;
                    self.fids.lock().remove(&fid);
                    reply(FCall::RClunk);
                });
            }

            FCall::TRemove { fid } => match self.fids.lock().remove(&fid) {
                None => reply(error("unknown fid")),
                Some(name) if name == "locked" => reply(error("permission denied")),
                Some(_) => reply(FCall::RRemove),
            },

            _ => reply(error("not supported")),
        }
    }
}

/// Connect a fresh client to `proxy` over an in-memory pipe.
pub async fn connect(proxy: Arc<Proxy>, config: Config) -> Conn {
    let (client, server) = tokio::io::duplex(1 << 16);
    tokio::spawn(proxy.serve(server));
    let (readhalf, writehalf) = tokio::io::split(client);
    Conn::new(readhalf, writehalf, config).await.unwrap()
}

/// The server end of a pipe, driven one frame at a time by the test.
pub struct Script {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
}

impl Script {
    fn new(stream: DuplexStream) -> Script {
        let (read, write) = tokio::io::split(stream);
        Script { read, write }
    }

    pub async fn recv(&mut self) -> Msg {
        let mut size = [0u8; SIZE_FIELD_LEN];
        self.read.read_exact(&mut size).await.unwrap();
        let mut frame = size.to_vec();
        frame.resize(u32::from_le_bytes(size) as usize, 0);
        self.read
            .read_exact(&mut frame[SIZE_FIELD_LEN..])
            .await
            .unwrap();
        serialize::decode_frame(&frame).unwrap()
    }

    pub async fn send(&mut self, msg: Msg) {
        self.send_raw(&serialize::encode_frame(&msg).unwrap()).await;
    }

    /// Write bytes verbatim, bypassing framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
        self.write.flush().await.unwrap();
    }

    /// True once the client has shut its end down.
    pub async fn closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.read.read(&mut byte).await, Ok(0))
    }
}

/// Start a client against a scripted server that answers `TVersion` with `rversion`.
pub async fn scripted(config: Config, rversion: FCall) -> (Result<Conn>, Script) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let (readhalf, writehalf) = tokio::io::split(client);

    let server = async move {
        let mut script = Script::new(server);
        let tversion = script.recv().await;
        assert_eq!(tversion.tag, NOTAG);
        script
            .send(Msg {
                tag: NOTAG,
                body: rversion,
            })
            .await;
        script
    };

    tokio::join!(Conn::new(readhalf, writehalf, config), server)
}

pub fn rversion(msize: u32) -> FCall {
    FCall::RVersion {
        msize,
        version: P92000.to_owned(),
    }
}

/// Wait up to a second for `cond` to hold.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
