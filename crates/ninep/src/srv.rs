//! Asynchronous server side 9P library.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{self, errno::*},
        fcall::*,
        io_err, sched, serialize,
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::buf::BufMut,
    futures::sink::SinkExt,
    log::{error, info},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, RwLock},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::length_delimited::LengthDelimitedCodec,
};

/// Concurrently served connections admitted per listener; further clients
/// queue on the accept semaphore in arrival order.
const MAX_CONNS: usize = 64;

/// Represents a fid of clients holding associated `Filesystem::FId`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FId<T> {
    /// Raw client side fid.
    fid: u32,

    /// `Filesystem::FId` associated with this fid.
    /// Changing this value affects the continuous callbacks.
    pub aux: T,
}

impl<T> FId<T> {
    /// Get the raw fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// Filesystem server trait for implementing 9P2000 servers.
///
/// The trait is the polymorphic file interface the dispatch loop
/// consumes: one method per T-message, each returning the matching
/// R-message. Implementors signal an error condition by returning `Err`;
/// the dispatch loop turns it into an `RError` response carrying
/// [`Error::ename`](crate::error::Error::ename).
///
/// # Minimum Implementation
///
/// For a read-only tree: [`rattach`](Self::rattach),
/// [`rwalk`](Self::rwalk), [`ropen`](Self::ropen), [`rread`](Self::rread)
/// and [`rclunk`](Self::rclunk). Writable trees additionally implement
/// [`rwrite`](Self::rwrite), [`rcreate`](Self::rcreate),
/// [`rremove`](Self::rremove) and [`rwstat`](Self::rwstat).
///
/// # FId Management
///
/// The associated `FId` type stores per-fid state such as the walked
/// path or an open handle. Fids come into being on attach and walk and
/// are dropped again by the dispatch loop on clunk and remove.
#[async_trait]
pub trait Filesystem: Send {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default;

    /// Authenticate a user. 9P2000 servers that require no authentication
    /// leave the default, which refuses the auth fid.
    async fn rauth(&self, _: &FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Attach a fid to the root of the served tree. The returned qid must
    /// have the directory bit set.
    async fn rattach(
        &self,
        _: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Walk a new fid from an existing one along `wnames`. The reply
    /// carries one qid per element actually walked; stopping short of the
    /// full list reports where the walk failed. The dispatch loop binds
    /// the new fid only when the walk was complete, so implementations
    /// should leave `_new` describing the deepest point reached.
    async fn rwalk(
        &self,
        _: &FId<Self::FId>,
        _new: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Open the file the fid points at, checking `mode` (see
    /// [`om`](crate::fcall::om)) against the caller's access class (the
    /// [`am`](crate::fcall::am) bits of the file's permission triples).
    async fn ropen(&self, _: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Create a file named `name` in the directory the fid points at and
    /// open it with `mode`. On success the fid points at the new file.
    async fn rcreate(
        &self,
        _: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read `count` bytes at `offset`. Reading a directory yields a
    /// concatenation of stat records, and the reply must hold a whole
    /// number of them.
    async fn rread(&self, _: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write `data` at `offset`, answering with the number of bytes
    /// accepted.
    async fn rwrite(&self, _: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Release the fid. The dispatch loop drops the fid whatever this
    /// returns.
    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Remove the file the fid points at. The fid is dropped like a
    /// clunk whether or not the remove succeeds.
    async fn rremove(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Describe the file the fid points at.
    async fn rstat(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Rewrite the metadata of the file the fid points at. Fields holding
    /// the all-ones (or empty string) sentinel are to be left untouched.
    async fn rwstat(&self, _: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Negotiate protocol version and message size. The first message of
    /// a session; the default accepts 9P2000, echoes the client's msize
    /// and answers `unknown` for other versions.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize,
            version: match ver {
                P92000 => ver.to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }
}

#[rustfmt::skip]
async fn dispatch_once<Fs, FsFId>(
    msg: &Msg,
    fs: Arc<Fs>,
    fsfids: Arc<RwLock<HashMap<u32, FId<FsFId>>>>,
) -> Result<FCall>
where
    Fs: Filesystem<FId = FsFId> + Send + Sync,
    FsFId: Send + Sync + Default,
{
    let newfid = msg.body.newfid().map(|f| FId {
        fid: f,
        aux: Default::default(),
    });

    use crate::FCall::*;
    let response = {
        let fids = fsfids.read().await;
        let get_fid = |fid: &u32| fids.get(fid).ok_or(error::Error::No(EBADF));
        let get_newfid = || newfid.as_ref().ok_or(error::Error::No(EPROTO));

        let fut = match msg.body {
            TVersion { ref msize, ref version }             => fs.rversion(*msize, version),
            TAuth { afid: _, ref uname, ref aname }         => fs.rauth(get_newfid()?, uname, aname),
            TAttach { fid: _, afid: _, ref uname, ref aname } => fs.rattach(get_newfid()?, None, uname, aname),
            TWalk { fid, newfid: _, ref wnames }            => fs.rwalk(get_fid(&fid)?, get_newfid()?, wnames),
            TOpen { fid, ref mode }                         => fs.ropen(get_fid(&fid)?, *mode),
            TCreate { fid, ref name, ref perm, ref mode }   => fs.rcreate(get_fid(&fid)?, name, *perm, *mode),
            TRead { fid, ref offset, ref count }            => fs.rread(get_fid(&fid)?, *offset, *count),
            TWrite { fid, ref offset, ref data }            => fs.rwrite(get_fid(&fid)?, *offset, data),
            TClunk { fid }                                  => fs.rclunk(get_fid(&fid)?),
            TRemove { fid }                                 => fs.rremove(get_fid(&fid)?),
            TStat { fid }                                   => fs.rstat(get_fid(&fid)?),
            TWStat { fid, ref stat }                        => fs.rwstat(get_fid(&fid)?, stat),
            _                                               => return Err(error::Error::No(EOPNOTSUPP)),
        };

        fut.await
    };

    /* A clunked or removed fid is gone no matter what the handler said */
    match msg.body {
        TClunk { fid } | TRemove { fid } => {
            let mut fids = fsfids.write().await;
            fids.remove(&fid);
        }
        _ => {}
    }

    let response = response?;

    if let Some(newfid) = newfid {
        // A walk binds its newfid only when every requested element was
        // actually walked.
        let complete = match (&msg.body, &response) {
            (TWalk { wnames, .. }, RWalk { wqids }) => wqids.len() == wnames.len(),
            _ => true,
        };
        if complete {
            let mut fids = fsfids.write().await;
            fids.insert(newfid.fid, newfid);
        }
    }

    Ok(response)
}

/// Serve one already-connected byte stream until the peer closes it.
///
/// Each request is handled on its own task, so a client that issues
/// concurrent requests under distinct tags gets its replies as they
/// complete.
pub async fn dispatch<Fs, Reader, Writer>(filesystem: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync,
    Reader: 'static + AsyncRead + Send + std::marker::Unpin,
    Writer: 'static + AsyncWrite + Send + std::marker::Unpin,
{
    let fsfids = Arc::new(RwLock::new(HashMap::new()));
    let filesystem = Arc::new(filesystem);

    let mut framedread = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let framedwrite = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);
    let framedwrite = Arc::new(Mutex::new(framedwrite));

    while let Some(bytes) = framedread.next().await {
        let bytes = bytes?;

        let msg = serialize::decode_msg(&bytes)?;
        info!("\t<- {:?}", msg);

        let fids = fsfids.clone();
        let fs = filesystem.clone();
        let framedwrite = framedwrite.clone();

        tokio::spawn(async move {
            let response_fcall = match dispatch_once(&msg, fs, fids).await {
                Ok(res) if MsgType::from(&res).is_r() => res,
                Ok(res) => {
                    error!("{:?}: handler returned {:?}", MsgType::from(&msg.body), MsgType::from(&res));
                    FCall::RError {
                        ename: error::string::EPROTO.to_owned(),
                    }
                }
                Err(e) => {
                    error!("{:?}: \"{}\"", MsgType::from(&msg.body), e);
                    FCall::RError { ename: e.ename() }
                }
            };

            let response = Msg {
                tag: msg.tag,
                body: response_fcall,
            };

            let mut writer = bytes::BytesMut::with_capacity(4096).writer();
            if let Err(e) = serialize::write_msg(&mut writer, &response) {
                error!("Failed to serialize response for tag {}: {:?}", msg.tag, e);
                return;
            }

            let frozen = writer.into_inner().freeze();
            {
                let mut framedwrite_locked = framedwrite.lock().await;
                if let Err(e) = framedwrite_locked.send(frozen).await {
                    error!("Failed to send response for tag {}: {:?}", msg.tag, e);
                    return;
                }
            }
            info!("\t-> {:?}", response);
        });
    }

    Ok(())
}

async fn srv_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let listener = TcpListener::bind(addr).await?;
    let conns = Arc::new(sched::Semaphore::new(MAX_CONNS));

    loop {
        conns.wait().await;
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        let conns = conns.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                error!("Error: {}: {:?}", e, e);
            }
            conns.post();
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            eprintln!(
                "Warning: Failed to remove socket file {:?}: {}",
                self.path, e
            );
        }
    }
}

/// Serve a Unix domain socket, shutting down cleanly on SIGINT/SIGTERM.
pub async fn srv_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let shutdown = Arc::new(sched::Wait::new());
    {
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            shutdown.notify();
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let fs = filesystem.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                        error!("Error: {:?}", e);
                    }
                });
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Serve `filesystem` at a dial string: `tcp!addr!port` or `unix!path`.
pub async fn srv<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Send + Sync + Clone,
{
    let (proto, listen_addr) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_tcp(filesystem, &listen_addr).await,
        "unix" => srv_unix(filesystem, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}
