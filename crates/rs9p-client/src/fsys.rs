//! Caller facing session API.
//!
//! An [`Fsys`] is an attached file tree; a [`Fid`] is a handle on one file in
//! it. Every operation is a thin layer over [`Conn::rpc`] and the connection's
//! [`FidPool`](crate::fid::FidPool).

use {
    crate::{
        conn::Conn,
        error::Error,
        fcall::*,
        utils::Result,
    },
    log::{debug, warn},
    parking_lot::Mutex,
    std::sync::atomic::{AtomicBool, Ordering},
};

impl Conn {
    /// Attach to the file tree `aname` as `user`, without authentication.
    pub async fn attach(&self, user: &str, aname: &str) -> Result<Fsys> {
        let fid = self.fids().allocate()?;
        let reply = self
            .rpc(FCall::TAttach {
                fid,
                afid: NOFID,
                uname: user.to_owned(),
                aname: aname.to_owned(),
            })
            .await;

        match reply {
            Ok(FCall::RAttach { qid }) => {
                self.fids().mark_active(fid, qid)?;
                Ok(Fsys {
                    root: Fid::new(self.clone(), fid, qid),
                })
            }
            Ok(other) => {
                self.release_unused(fid);
                Err(Error::unexpected(MsgType::RAttach, other))
            }
            Err(e) => {
                self.release_unused(fid);
                Err(e)
            }
        }
    }

    fn release_unused(&self, fid: u32) {
        if let Err(e) = self.fids().release_unused(fid) {
            warn!("releasing fid {}: {}", fid, e);
        }
    }

    /// Send a request that retires `fid` and free the number on the reply.
    ///
    /// The exchange runs in its own task, so the number is freed on the
    /// server's answer even if the caller stops waiting.
    async fn retire(&self, fid: u32, body: FCall) -> Result<()> {
        let token = self.fids().begin_retire(fid)?;
        let conn = self.clone();
        let exchange = tokio::spawn(async move {
            let reply = conn.rpc(body).await;
            match reply {
                // Tclunk and Tremove release the fid even when they fail.
                Ok(_) | Err(Error::ServerRejected(_)) => conn.fids().confirm_retire(token),
                Err(_) => drop(token),
            }
            reply.map(|_| ())
        });
        exchange.await.unwrap_or(Err(Error::ConnectionClosed))
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// An attached file tree.
#[derive(Debug)]
pub struct Fsys {
    root: Fid,
}

impl Fsys {
    /// The fid returned by attach.
    pub fn root(&self) -> &Fid {
        &self.root
    }

    /// Walk from the root to `path`. Empty elements are ignored.
    pub async fn walk(&self, path: &str) -> Result<Fid> {
        self.root.walk(&split_path(path)).await
    }

    /// Walk to `path` and open it.
    pub async fn open(&self, path: &str, mode: u8) -> Result<Fid> {
        let fid = self.walk(path).await?;
        if let Err(e) = fid.open(mode).await {
            if let Err(ce) = fid.close().await {
                debug!("close after failed open of {}: {}", path, ce);
            }
            return Err(e);
        }
        Ok(fid)
    }

    /// Create `path` in its parent directory and open it with `mode`.
    pub async fn create(&self, path: &str, mode: u8, perm: u32) -> Result<Fid> {
        let mut names = split_path(path);
        let name = names
            .pop()
            .ok_or_else(|| Error::BadRequest(format!("cannot create {:?}", path)))?;

        let fid = self.root.walk(&names).await?;
        if let Err(e) = fid.create(name, mode, perm).await {
            if let Err(ce) = fid.close().await {
                debug!("close after failed create of {}: {}", path, ce);
            }
            return Err(e);
        }
        Ok(fid)
    }

    /// Remove the file at `path`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.walk(path).await?.remove().await
    }

    /// Clunk the root fid.
    pub async fn close(&self) -> Result<()> {
        self.root.close().await
    }
}

#[derive(Debug)]
struct FidInfo {
    qid: QId,
    mode: Option<u8>,
    iounit: u32,
    offset: u64,
}

/// Handle on one server side fid.
///
/// The handle is dead as soon as [`close`](Fid::close) or
/// [`remove`](Fid::remove) starts; the number behind it is recycled only
/// after the server answers. A handle dropped while still open is clunked in
/// the background.
#[derive(Debug)]
pub struct Fid {
    conn: Conn,
    fid: u32,
    info: Mutex<FidInfo>,
    closed: AtomicBool,
}

impl Fid {
    fn new(conn: Conn, fid: u32, qid: QId) -> Fid {
        Fid {
            conn,
            fid,
            info: Mutex::new(FidInfo {
                qid,
                mode: None,
                iounit: 0,
                offset: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Raw fid number.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> QId {
        self.info.lock().qid
    }

    /// Open mode, once opened or created.
    pub fn mode(&self) -> Option<u8> {
        self.info.lock().mode
    }

    /// I/O unit reported by open/create; 0 if the server gave none.
    pub fn iounit(&self) -> u32 {
        self.info.lock().iounit
    }

    /// Offset used by [`read`](Fid::read) and [`write`](Fid::write).
    pub fn offset(&self) -> u64 {
        self.info.lock().offset
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::FidClosed(self.fid));
        }
        Ok(())
    }

    /// Largest payload one read or write may carry.
    ///
    /// An `iounit` that would not fit in one message is ignored.
    fn io_limit(&self) -> usize {
        let max = self.conn.msize() - IOHDRSZ;
        match self.iounit() {
            0 => max as usize,
            iounit => iounit.min(max) as usize,
        }
    }

    /// Walk `names` from this fid into a fresh fid. No names clones the fid.
    pub async fn walk<S: AsRef<str>>(&self, names: &[S]) -> Result<Fid> {
        self.check_open()?;
        if names.len() > MAXWELEM {
            return Err(Error::TooManyWalkNames(names.len()));
        }

        let wnames: Vec<String> = names.iter().map(|s| s.as_ref().to_owned()).collect();
        let newfid = self.conn.fids().allocate()?;
        let reply = self
            .conn
            .rpc(FCall::TWalk {
                fid: self.fid,
                newfid,
                wnames: wnames.clone(),
            })
            .await;

        let wqids = match reply {
            Ok(FCall::RWalk { wqids }) => wqids,
            Ok(other) => {
                self.conn.release_unused(newfid);
                return Err(Error::unexpected(MsgType::RWalk, other));
            }
            Err(e) => {
                self.conn.release_unused(newfid);
                return Err(e);
            }
        };

        if wqids.len() > wnames.len() {
            return Err(self.conn.fail(Error::MalformedMessage(format!(
                "walk of {} names returned {} qids",
                wnames.len(),
                wqids.len()
            ))));
        }
        if wqids.len() < wnames.len() {
            // The server did not create newfid.
            self.conn.release_unused(newfid);
            return Err(Error::NotFound(wnames[wqids.len()].clone()));
        }

        let qid = wqids.last().copied().unwrap_or_else(|| self.qid());
        self.conn.fids().mark_active(newfid, qid)?;
        Ok(Fid::new(self.conn.clone(), newfid, qid))
    }

    /// Prepare the fid for I/O.
    pub async fn open(&self, mode: u8) -> Result<()> {
        self.check_open()?;
        match self
            .conn
            .rpc(FCall::TOpen {
                fid: self.fid,
                mode,
            })
            .await?
        {
            FCall::ROpen { qid, iounit } => {
                self.opened(qid, iounit, mode);
                Ok(())
            }
            other => Err(Error::unexpected(MsgType::ROpen, other)),
        }
    }

    /// Create `name` in this directory; the fid then names the new file, opened with `mode`.
    pub async fn create(&self, name: &str, mode: u8, perm: u32) -> Result<()> {
        self.check_open()?;
        match self
            .conn
            .rpc(FCall::TCreate {
                fid: self.fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await?
        {
            FCall::RCreate { qid, iounit } => {
                self.opened(qid, iounit, mode);
                Ok(())
            }
            other => Err(Error::unexpected(MsgType::RCreate, other)),
        }
    }

    fn opened(&self, qid: QId, iounit: u32, mode: u8) {
        let mut info = self.info.lock();
        info.qid = qid;
        info.iounit = iounit;
        info.mode = Some(mode);
        info.offset = 0;
    }

    /// Read at `offset` into `buf`; 0 means end of file.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let count = buf.len().min(self.io_limit());
        let data = match self
            .conn
            .rpc(FCall::TRead {
                fid: self.fid,
                offset,
                count: count as u32,
            })
            .await?
        {
            FCall::RRead { data } => data.0,
            other => return Err(Error::unexpected(MsgType::RRead, other)),
        };

        if data.len() > count {
            return Err(self.conn.fail(Error::ProtocolViolation(format!(
                "read of {} bytes returned {}",
                count,
                data.len()
            ))));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Read at the current offset and advance it.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.offset()).await?;
        self.info.lock().offset += n as u64;
        Ok(n)
    }

    /// Read from the current offset to end of file.
    pub async fn read_to_end(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0; self.io_limit()];
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(out),
                n => out.extend_from_slice(&buf[..n]),
            }
        }
    }

    /// Write all of `data` at `offset`, in `iounit` sized pieces.
    pub async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let limit = self.io_limit();
        let mut written = 0;
        // A zero length write is still sent once.
        loop {
            let chunk = &data[written..(written + limit).min(data.len())];
            let count = match self
                .conn
                .rpc(FCall::TWrite {
                    fid: self.fid,
                    offset: offset + written as u64,
                    data: Data(chunk.to_vec()),
                })
                .await?
            {
                FCall::RWrite { count } => count as usize,
                other => return Err(Error::unexpected(MsgType::RWrite, other)),
            };

            if count > chunk.len() {
                return Err(self.conn.fail(Error::ProtocolViolation(format!(
                    "write of {} bytes acknowledged {}",
                    chunk.len(),
                    count
                ))));
            }
            if count == 0 && !chunk.is_empty() {
                return Err(Error::ShortWrite);
            }
            written += count;
            if written >= data.len() {
                return Ok(written);
            }
        }
    }

    /// Write at the current offset and advance it.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        let n = self.write_at(data, self.offset()).await?;
        self.info.lock().offset += n as u64;
        Ok(n)
    }

    /// Clunk the fid. The handle is unusable from the moment this is called.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::FidClosed(self.fid));
        }
        self.conn.retire(self.fid, FCall::TClunk { fid: self.fid }).await
    }

    /// Remove the file and clunk the fid, whether or not the remove succeeds.
    pub async fn remove(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::FidClosed(self.fid));
        }
        self.conn.retire(self.fid, FCall::TRemove { fid: self.fid }).await
    }
}

impl Drop for Fid {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) || self.conn.is_closed() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("fid {} dropped outside a runtime; not clunked", self.fid);
            return;
        };

        warn!("fid {} dropped without close; clunking", self.fid);
        let conn = self.conn.clone();
        let fid = self.fid;
        runtime.spawn(async move {
            if let Err(e) = conn.retire(fid, FCall::TClunk { fid }).await {
                debug!("background clunk of fid {}: {}", fid, e);
            }
        });
    }
}
