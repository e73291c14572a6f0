//! Client side 9P session engine.
//!
//! A [`Session`] owns a connected transport and carries a client through
//! the 9P lifecycle: version handshake, attach, then path operations that
//! walk a scratch fid from the attached root, act on it and clunk it
//! again. Calls are strictly request/response; the response tag is checked
//! against the request and an `RError` surfaces as
//! [`Error::Remote`](crate::error::Error::Remote) after the scratch fid
//! has been released.

use {
    crate::{
        error::{self, errno::*},
        fcall::*,
        io_err, res,
        serialize::{self, Decodable},
        utils::Result,
    },
    bytes::buf::BufMut,
    log::debug,
    std::io::Cursor,
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_stream::StreamExt,
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

use futures::sink::SinkExt;

/// Size of the client's message buffer, offered as msize in TVersion
pub const MSIZE: u32 = 1 << 13;

/// The attached root directory keeps this fid for the whole session
const ROOT_FID: u32 = 0;

/// Scratch fid walked from the root for each operation, clunked after
const OP_FID: u32 = 1;

/// Split a path into walk elements.
///
/// Empty segments and `.` vanish, so leading, trailing and doubled
/// slashes collapse; `..` is passed through for the server to resolve
/// relative to the walked fid.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

fn unexpected<T>() -> Result<T> {
    res!(io_err!(InvalidData, "unexpected response type"))
}

/// The operation's outcome wins over the trailing clunk's, but a clunk
/// failure still fails an otherwise successful operation.
fn finish<T>(out: Result<T>, clunked: Result<()>) -> Result<T> {
    match out {
        Ok(v) => clunked.and(Ok(v)),
        Err(e) => Err(e),
    }
}

/// An attached 9P2000 session over a stream transport.
pub struct Session<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    msize: u32,
    tag: u16,
    root_qid: QId,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Negotiate the protocol version and attach to the server's root
    /// directory as `uname`.
    pub async fn attach(stream: S, uname: &str, aname: &str) -> Result<Session<S>> {
        let framed = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .little_endian()
            .max_frame_length(MSIZE as usize)
            .new_framed(stream);

        let mut session = Session {
            framed,
            msize: MSIZE,
            tag: 0,
            root_qid: QId::default(),
        };

        match session
            .call(FCall::TVersion {
                msize: MSIZE,
                version: P92000.to_owned(),
            })
            .await?
        {
            FCall::RVersion { msize, version } => {
                if version != P92000 {
                    return res!(io_err!(InvalidData, "unexpected protocol version"));
                }
                if msize <= IOHDRSZ || msize > MSIZE {
                    return res!(io_err!(InvalidData, "invalid msize"));
                }
                session.msize = msize;
            }
            _ => return unexpected(),
        }

        match session
            .call(FCall::TAttach {
                fid: ROOT_FID,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            FCall::RAttach { qid } => {
                if !qid.typ.contains(QIdType::DIR) {
                    return res!(io_err!(InvalidData, "root is not a directory"));
                }
                session.root_qid = qid;
            }
            _ => return unexpected(),
        }

        Ok(session)
    }

    /// The negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// The qid of the directory the session is attached to.
    pub fn root_qid(&self) -> QId {
        self.root_qid
    }

    fn next_tag(&mut self) -> u16 {
        let tag = self.tag;
        self.tag = self.tag.wrapping_add(1);
        if self.tag == NOTAG {
            self.tag = 0;
        }
        tag
    }

    async fn call(&mut self, body: FCall) -> Result<FCall> {
        let tag = match body {
            FCall::TVersion { .. } => NOTAG,
            _ => self.next_tag(),
        };
        let req = Msg { tag, body };
        debug!("-> {:?}", req);

        let mut writer = bytes::BytesMut::with_capacity(256).writer();
        serialize::write_msg(&mut writer, &req)?;
        self.framed.send(writer.into_inner().freeze()).await?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| io_err!(UnexpectedEof, "connection closed"))??;
        let resp = serialize::decode_msg(&frame)?;
        debug!("<- {:?}", resp);

        if resp.tag != tag {
            return res!(io_err!(InvalidData, "mismatched tag"));
        }
        match resp.body {
            FCall::RError { ename } => Err(error::Error::Remote(ename)),
            body => Ok(body),
        }
    }

    /// Walk `newfid` from `fid` along `path`, chunking at [`MAXWELEM`]
    /// elements per request. A reply with fewer qids than names means the
    /// file does not exist.
    async fn walk_fid(&mut self, fid: u32, newfid: u32, path: &str) -> Result<Vec<QId>> {
        let names = split_path(path);
        let mut wqids = Vec::with_capacity(names.len());
        let mut from = fid;
        let mut sent = 0;
        let mut bound = false;

        loop {
            let end = (sent + MAXWELEM).min(names.len());
            let wnames: Vec<String> = names[sent..end].iter().map(|s| (*s).to_owned()).collect();
            let expect = wnames.len();

            let reply = self
                .call(FCall::TWalk {
                    fid: from,
                    newfid,
                    wnames,
                })
                .await;
            match reply {
                Ok(FCall::RWalk { wqids: qids }) => {
                    if qids.len() > expect {
                        return unexpected();
                    }
                    let got = qids.len();
                    wqids.extend(qids);
                    if got < expect {
                        if bound {
                            let _ = self.clunk(newfid).await;
                        }
                        return Err(error::Error::No(ENOENT));
                    }
                    bound = true;
                }
                Ok(_) => return unexpected(),
                Err(e) => {
                    if bound {
                        let _ = self.clunk(newfid).await;
                    }
                    return Err(e);
                }
            }

            sent = end;
            if sent >= names.len() {
                return Ok(wqids);
            }
            from = newfid;
        }
    }

    async fn open_fid(&mut self, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.call(FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            _ => unexpected(),
        }
    }

    async fn clunk(&mut self, fid: u32) -> Result<()> {
        match self.call(FCall::TClunk { fid }).await? {
            FCall::RClunk => Ok(()),
            _ => unexpected(),
        }
    }

    /// Per-request read budget: the exact RRead header cost leaves
    /// `msize - 11` bytes of data, further clamped by a nonzero iounit.
    fn read_chunk(&self, iounit: u32) -> u32 {
        let budget = self.msize - RREADHDRSZ;
        if iounit == 0 { budget } else { iounit.min(budget) }
    }

    /// Per-request write budget, clamped by a nonzero iounit.
    fn write_chunk(&self, iounit: u32) -> u32 {
        let budget = self.msize - IOHDRSZ;
        if iounit == 0 { budget } else { iounit.min(budget) }
    }

    /// Read a whole file.
    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        let out = self.read_file_op().await;
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    async fn read_file_op(&mut self) -> Result<Vec<u8>> {
        let (qid, iounit) = self.open_fid(OP_FID, om::READ).await?;
        if qid.typ.contains(QIdType::DIR) {
            return Err(error::Error::No(EISDIR));
        }

        let count = self.read_chunk(iounit);
        let mut bytes = Vec::new();
        let mut offset = 0u64;
        loop {
            match self
                .call(FCall::TRead {
                    fid: OP_FID,
                    offset,
                    count,
                })
                .await?
            {
                FCall::RRead { data } => {
                    if data.0.is_empty() {
                        return Ok(bytes);
                    }
                    offset += data.0.len() as u64;
                    bytes.extend_from_slice(&data.0);
                }
                _ => return unexpected(),
            }
        }
    }

    /// Truncate a file and write `data` to it from offset zero.
    pub async fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        let out = self.write_file_op(data).await;
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    async fn write_file_op(&mut self, data: &[u8]) -> Result<()> {
        let (qid, iounit) = self.open_fid(OP_FID, om::WRITE | om::TRUNC).await?;
        if qid.typ.contains(QIdType::DIR) {
            return Err(error::Error::No(EISDIR));
        }

        let chunk = self.write_chunk(iounit) as usize;
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            match self
                .call(FCall::TWrite {
                    fid: OP_FID,
                    offset: offset as u64,
                    data: Data(data[offset..end].to_vec()),
                })
                .await?
            {
                FCall::RWrite { count } => {
                    // A server that accepts nothing would never progress.
                    if count == 0 {
                        return Err(error::Error::No(EIO));
                    }
                    offset += count as usize;
                }
                _ => return unexpected(),
            }
        }
        Ok(())
    }

    /// List a directory. The payload of each read is a concatenation of
    /// stat records; records never cross read boundaries.
    pub async fn read_dir(&mut self, path: &str) -> Result<Vec<Stat>> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        let out = self.read_dir_op().await;
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    async fn read_dir_op(&mut self) -> Result<Vec<Stat>> {
        let (qid, iounit) = self.open_fid(OP_FID, om::READ).await?;
        if !qid.typ.contains(QIdType::DIR) {
            return Err(error::Error::No(ENOTDIR));
        }

        let count = self.read_chunk(iounit);
        let mut stats = Vec::new();
        let mut offset = 0u64;
        loop {
            match self
                .call(FCall::TRead {
                    fid: OP_FID,
                    offset,
                    count,
                })
                .await?
            {
                FCall::RRead { data } => {
                    if data.0.is_empty() {
                        return Ok(stats);
                    }
                    offset += data.0.len() as u64;

                    let mut cur = Cursor::new(&data.0[..]);
                    while (cur.position() as usize) < data.0.len() {
                        let stat: Stat = Decodable::decode(&mut cur)?;
                        stats.push(stat);
                    }
                }
                _ => return unexpected(),
            }
        }
    }

    /// Stat a file or directory.
    pub async fn stat(&mut self, path: &str) -> Result<Stat> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        let out = match self.call(FCall::TStat { fid: OP_FID }).await {
            Ok(FCall::RStat { stat }) => Ok(stat),
            Ok(_) => unexpected(),
            Err(e) => Err(e),
        };
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    /// Rewrite a file's metadata. Fields of `stat` left at the
    /// [`Stat::dont_touch`] sentinel are not changed by the server.
    pub async fn wstat(&mut self, path: &str, stat: Stat) -> Result<()> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        let out = match self.call(FCall::TWStat { fid: OP_FID, stat }).await {
            Ok(FCall::RWStat) => Ok(()),
            Ok(_) => unexpected(),
            Err(e) => Err(e),
        };
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    /// Change only a file's permission bits.
    pub async fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        let mut stat = Stat::dont_touch();
        stat.mode = mode;
        self.wstat(path, stat).await
    }

    /// Create a file under the last directory of `path` with the given
    /// permissions. Directories are created by or'ing [`dm::DIR`] into
    /// `perm` (see [`Session::mkdir`]).
    pub async fn create(&mut self, path: &str, perm: u32) -> Result<QId> {
        let (dir, name) = match path.rfind('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("", path),
        };
        if name.is_empty() || name == "." || name == ".." {
            return res!(io_err!(InvalidInput, "illegal name"));
        }

        self.walk_fid(ROOT_FID, OP_FID, dir).await?;
        let out = match self
            .call(FCall::TCreate {
                fid: OP_FID,
                name: name.to_owned(),
                perm,
                mode: om::READ,
            })
            .await
        {
            Ok(FCall::RCreate { qid, .. }) => Ok(qid),
            Ok(_) => unexpected(),
            Err(e) => Err(e),
        };
        let clunked = self.clunk(OP_FID).await;
        finish(out, clunked)
    }

    /// Create a directory.
    pub async fn mkdir(&mut self, path: &str, perm: u32) -> Result<QId> {
        self.create(path, dm::DIR | perm).await
    }

    /// Remove a file or directory. The walked fid is clunked by the
    /// server whether or not the remove succeeds.
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        self.walk_fid(ROOT_FID, OP_FID, path).await?;
        match self.call(FCall::TRemove { fid: OP_FID }).await? {
            FCall::RRemove => Ok(()),
            _ => unexpected(),
        }
    }

    /// Move the attached root onto a directory reached by a relative
    /// path. The server rebinds fid 0 only if the whole walk succeeds, so
    /// a failed chdir leaves the session where it was.
    pub async fn chdir(&mut self, path: &str) -> Result<()> {
        let names: Vec<String> = split_path(path).iter().map(|s| (*s).to_owned()).collect();
        if names.len() > MAXWELEM {
            return res!(io_err!(InvalidInput, "too many path elements"));
        }
        let expect = names.len();

        match self
            .call(FCall::TWalk {
                fid: ROOT_FID,
                newfid: ROOT_FID,
                wnames: names,
            })
            .await?
        {
            FCall::RWalk { wqids } if wqids.len() == expect => Ok(()),
            FCall::RWalk { .. } => Err(error::Error::No(ENOENT)),
            _ => unexpected(),
        }
    }

    /// End the session, releasing the attached root fid.
    pub async fn detach(mut self) -> Result<()> {
        self.clunk(ROOT_FID).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srv::{self, FId, Filesystem};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[test]
    fn split_path_collapses_slashes() {
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
        assert!(split_path("").is_empty());
        assert!(split_path("/").is_empty());
        assert_eq!(split_path("a"), vec!["a"]);
        assert_eq!(split_path("./x/."), vec!["x"]);
        assert_eq!(split_path("a/../b"), vec!["a", "..", "b"]);
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Node {
        Dir,
        File(Vec<u8>),
    }

    #[derive(Debug, Default)]
    struct State {
        // Flat namespace: the root plus entries addressed by name.
        tree: HashMap<String, Node>,
        modes: HashMap<String, u32>,
        treads: u32,
        writes: Vec<(u64, usize)>,
        wstats: Vec<(String, Stat)>,
    }

    /// In-memory filesystem scripted for the session tests.
    #[derive(Clone)]
    struct TestFs {
        state: Arc<Mutex<State>>,
        msize: u32,
        iounit: u32,
        /// Bytes accepted per TWrite; zero means everything offered.
        write_quota: u32,
    }

    impl TestFs {
        fn new(msize: u32) -> TestFs {
            TestFs {
                state: Arc::new(Mutex::new(State::default())),
                msize,
                iounit: 0,
                write_quota: 0,
            }
        }

        fn with_file(self, name: &str, content: &[u8]) -> TestFs {
            self.state
                .lock()
                .unwrap()
                .tree
                .insert(name.to_owned(), Node::File(content.to_vec()));
            self
        }

        fn with_dir(self, name: &str) -> TestFs {
            self.state
                .lock()
                .unwrap()
                .tree
                .insert(name.to_owned(), Node::Dir);
            self
        }

        fn qid_of(&self, path: &str, node: &Node) -> QId {
            let typ = match node {
                Node::Dir => QIdType::DIR,
                Node::File(_) => QIdType::FILE,
            };
            let id = if path.is_empty() {
                1
            } else {
                2 + path.bytes().fold(0u64, |a, b| a * 31 + b as u64) % 1000
            };
            QId {
                typ,
                version: 0,
                path: id,
            }
        }

        fn lookup(&self, path: &str) -> Option<Node> {
            if path.is_empty() {
                return Some(Node::Dir);
            }
            self.state.lock().unwrap().tree.get(path).cloned()
        }

        fn root_listing(&self) -> Vec<u8> {
            let state = self.state.lock().unwrap();
            let mut names: Vec<&String> = state.tree.keys().collect();
            names.sort();

            let mut payload = Vec::new();
            for name in names {
                let node = &state.tree[name];
                let stat = Stat {
                    qid: self.qid_of(name, node),
                    mode: state.modes.get(name).copied().unwrap_or(0o644),
                    length: match node {
                        Node::Dir => 0,
                        Node::File(content) => content.len() as u64,
                    },
                    name: name.clone(),
                    uid: "glenda".to_owned(),
                    gid: "sys".to_owned(),
                    muid: "glenda".to_owned(),
                    ..Stat::default()
                };
                crate::serialize::Encodable::encode(&stat, &mut payload).unwrap();
            }
            payload
        }
    }

    #[async_trait]
    impl Filesystem for TestFs {
        type FId = Mutex<String>;

        async fn rversion(&self, msize: u32, ver: &str) -> crate::Result<FCall> {
            Ok(FCall::RVersion {
                msize: msize.min(self.msize),
                version: match ver {
                    P92000 => ver.to_owned(),
                    _ => VERSION_UNKNOWN.to_owned(),
                },
            })
        }

        async fn rattach(
            &self,
            fid: &FId<Self::FId>,
            _afid: Option<&FId<Self::FId>>,
            _uname: &str,
            _aname: &str,
        ) -> crate::Result<FCall> {
            *fid.aux.lock().unwrap() = String::new();
            Ok(FCall::RAttach {
                qid: self.qid_of("", &Node::Dir),
            })
        }

        async fn rwalk(
            &self,
            fid: &FId<Self::FId>,
            newfid: &FId<Self::FId>,
            wnames: &[String],
        ) -> crate::Result<FCall> {
            let mut path = fid.aux.lock().unwrap().clone();
            let mut wqids = Vec::new();

            for (i, name) in wnames.iter().enumerate() {
                // The scripted tree is flat: only the root holds entries,
                // so any nested name fails the lookup below.
                let next = if name == ".." {
                    String::new()
                } else if path.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", path, name)
                };

                match self.lookup(&next) {
                    Some(node) => {
                        wqids.push(self.qid_of(&next, &node));
                        path = next;
                    }
                    None => {
                        if i == 0 {
                            return Err(error::Error::Remote("file not found".to_owned()));
                        }
                        break;
                    }
                }
            }

            *newfid.aux.lock().unwrap() = path;
            Ok(FCall::RWalk { wqids })
        }

        async fn ropen(&self, fid: &FId<Self::FId>, _mode: u8) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            match self.lookup(&path) {
                Some(node) => Ok(FCall::ROpen {
                    qid: self.qid_of(&path, &node),
                    iounit: self.iounit,
                }),
                None => Err(error::Error::No(ENOENT)),
            }
        }

        async fn rcreate(
            &self,
            fid: &FId<Self::FId>,
            name: &str,
            perm: u32,
            _mode: u8,
        ) -> crate::Result<FCall> {
            let node = if perm & dm::DIR != 0 {
                Node::Dir
            } else {
                Node::File(Vec::new())
            };
            {
                let mut state = self.state.lock().unwrap();
                if state.tree.contains_key(name) {
                    return Err(error::Error::No(EEXIST));
                }
                state.tree.insert(name.to_owned(), node.clone());
                state.modes.insert(name.to_owned(), perm & 0o777);
            }
            *fid.aux.lock().unwrap() = name.to_owned();
            Ok(FCall::RCreate {
                qid: self.qid_of(name, &node),
                iounit: self.iounit,
            })
        }

        async fn rread(
            &self,
            fid: &FId<Self::FId>,
            offset: u64,
            count: u32,
        ) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            self.state.lock().unwrap().treads += 1;

            let content = match self.lookup(&path) {
                Some(Node::File(content)) => content,
                Some(Node::Dir) if path.is_empty() => self.root_listing(),
                Some(Node::Dir) => Vec::new(),
                None => return Err(error::Error::No(ENOENT)),
            };

            let start = (offset as usize).min(content.len());
            let end = (start + count as usize).min(content.len());
            Ok(FCall::RRead {
                data: Data(content[start..end].to_vec()),
            })
        }

        async fn rwrite(
            &self,
            fid: &FId<Self::FId>,
            offset: u64,
            data: &Data,
        ) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            let accepted = if self.write_quota == 0 {
                data.0.len()
            } else {
                data.0.len().min(self.write_quota as usize)
            };

            let mut state = self.state.lock().unwrap();
            state.writes.push((offset, data.0.len()));
            match state.tree.get_mut(&path) {
                Some(Node::File(content)) => {
                    let end = offset as usize + accepted;
                    if content.len() < end {
                        content.resize(end, 0);
                    }
                    content[offset as usize..end].copy_from_slice(&data.0[..accepted]);
                    Ok(FCall::RWrite {
                        count: accepted as u32,
                    })
                }
                _ => Err(error::Error::No(EBADF)),
            }
        }

        async fn rclunk(&self, _: &FId<Self::FId>) -> crate::Result<FCall> {
            Ok(FCall::RClunk)
        }

        async fn rremove(&self, fid: &FId<Self::FId>) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            match self.state.lock().unwrap().tree.remove(&path) {
                Some(_) => Ok(FCall::RRemove),
                None => Err(error::Error::No(ENOENT)),
            }
        }

        async fn rstat(&self, fid: &FId<Self::FId>) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            match self.lookup(&path) {
                Some(node) => Ok(FCall::RStat {
                    stat: Stat {
                        qid: self.qid_of(&path, &node),
                        mode: self
                            .state
                            .lock()
                            .unwrap()
                            .modes
                            .get(&path)
                            .copied()
                            .unwrap_or(0o644),
                        length: match &node {
                            Node::Dir => 0,
                            Node::File(content) => content.len() as u64,
                        },
                        name: if path.is_empty() {
                            "/".to_owned()
                        } else {
                            path.clone()
                        },
                        uid: "glenda".to_owned(),
                        gid: "sys".to_owned(),
                        muid: "glenda".to_owned(),
                        ..Stat::default()
                    },
                }),
                None => Err(error::Error::No(ENOENT)),
            }
        }

        async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> crate::Result<FCall> {
            let path = fid.aux.lock().unwrap().clone();
            let mut state = self.state.lock().unwrap();
            if stat.mode != !0 {
                state.modes.insert(path.clone(), stat.mode);
            }
            state.wstats.push((path, stat.clone()));
            Ok(FCall::RWStat)
        }
    }

    async fn serve(fs: TestFs) -> Session<tokio::io::DuplexStream> {
        let (client_end, server_end) = tokio::io::duplex(1 << 16);
        let (reader, writer) = tokio::io::split(server_end);
        tokio::spawn(async move {
            let _ = srv::dispatch(fs, reader, writer).await;
        });
        Session::attach(client_end, "glenda", "").await.unwrap()
    }

    #[tokio::test]
    async fn version_negotiation_adopts_server_msize() {
        let fs = TestFs::new(4096);
        let session = serve(fs).await;
        assert_eq!(session.msize(), 4096);
        assert_eq!(
            session.root_qid(),
            QId {
                typ: QIdType::DIR,
                version: 0,
                path: 1
            }
        );
    }

    #[tokio::test]
    async fn missing_first_component_surfaces_server_error() {
        let fs = TestFs::new(4096);
        let mut session = serve(fs).await;
        match session.stat("/missing").await {
            Err(error::Error::Remote(ename)) => assert_eq!(ename, "file not found"),
            other => panic!("expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_walk_is_not_found() {
        let fs = TestFs::new(4096).with_dir("tmp");
        let mut session = serve(fs).await;
        match session.stat("/tmp/x").await {
            Err(error::Error::No(e)) => assert_eq!(e, ENOENT),
            other => panic!("expected ENOENT, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_reassembles_a_large_file() {
        let content: Vec<u8> = (0..10000u32).map(|i| (i % 251) as u8).collect();
        let fs = TestFs::new(4096).with_file("big", &content);
        let state = fs.state.clone();

        let mut session = serve(fs).await;
        let bytes = session.read_file("/big").await.unwrap();
        assert_eq!(bytes, content);
        // 10000 bytes at 4085 per read, plus the terminating empty read.
        assert!(state.lock().unwrap().treads >= 3);
    }

    #[tokio::test]
    async fn read_loop_respects_iounit() {
        let content = vec![7u8; 250];
        let mut fs = TestFs::new(8192).with_file("f", &content);
        fs.iounit = 100;
        let state = fs.state.clone();

        let mut session = serve(fs).await;
        let bytes = session.read_file("/f").await.unwrap();
        assert_eq!(bytes, content);
        // ceil(250 / 100) + 1 terminating read
        assert_eq!(state.lock().unwrap().treads, 4);
    }

    #[tokio::test]
    async fn short_writes_resume_where_the_server_stopped() {
        let mut fs = TestFs::new(4096).with_file("f", b"");
        fs.write_quota = 3;
        let state = fs.state.clone();

        let mut session = serve(fs).await;
        session.write_file("/f", b"hello").await.unwrap();

        let state = state.lock().unwrap();
        let offsets: Vec<u64> = state.writes.iter().map(|w| w.0).collect();
        assert_eq!(offsets, vec![0, 3]);
        assert_eq!(state.tree["f"], Node::File(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn chmod_sends_the_dont_touch_sentinel() {
        let fs = TestFs::new(4096).with_file("f", b"x");
        let state = fs.state.clone();

        let mut session = serve(fs).await;
        session.chmod("/f", 0o755).await.unwrap();

        let state = state.lock().unwrap();
        let (path, stat) = &state.wstats[0];
        assert_eq!(path, "f");
        assert_eq!(stat.mode, 0o755);
        assert_eq!(stat.typ, u16::MAX);
        assert_eq!(stat.dev, u32::MAX);
        assert_eq!(stat.qid.path, u64::MAX);
        assert_eq!(stat.atime, u32::MAX);
        assert_eq!(stat.mtime, u32::MAX);
        assert_eq!(stat.length, u64::MAX);
        assert!(stat.name.is_empty());
        assert!(stat.uid.is_empty());
        assert_eq!(state.modes["f"], 0o755);
    }

    #[tokio::test]
    async fn read_dir_parses_concatenated_stats() {
        let fs = TestFs::new(4096)
            .with_file("alpha", b"1")
            .with_file("beta", b"22")
            .with_dir("gamma");

        let mut session = serve(fs).await;
        let stats = session.read_dir("/").await.unwrap();
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        assert_eq!(stats[1].length, 2);
        assert!(stats[2].is_dir());
    }

    #[tokio::test]
    async fn create_write_read_remove_cycle() {
        let fs = TestFs::new(4096);
        let mut session = serve(fs).await;

        let qid = session.create("/notes", 0o644).await.unwrap();
        assert!(!qid.typ.contains(QIdType::DIR));

        session.write_file("/notes", b"remember").await.unwrap();
        assert_eq!(session.read_file("/notes").await.unwrap(), b"remember");

        session.remove("/notes").await.unwrap();
        assert!(session.stat("/notes").await.is_err());
    }

    #[tokio::test]
    async fn mkdir_sets_the_directory_bit() {
        let fs = TestFs::new(4096);
        let state = fs.state.clone();
        let mut session = serve(fs).await;

        let qid = session.mkdir("/work", 0o755).await.unwrap();
        assert!(qid.typ.contains(QIdType::DIR));
        assert_eq!(state.lock().unwrap().tree["work"], Node::Dir);
    }

    #[tokio::test]
    async fn chdir_moves_the_root_only_on_success() {
        let fs = TestFs::new(4096).with_dir("tmp");
        let mut session = serve(fs).await;

        assert!(session.chdir("nope").await.is_err());
        // Root still lists the original directory.
        let stats = session.read_dir("").await.unwrap();
        assert_eq!(stats.len(), 1);

        session.chdir("tmp").await.unwrap();
        let stats = session.read_dir("").await.unwrap();
        assert!(stats.is_empty());
    }

    #[tokio::test]
    async fn reading_a_directory_as_a_file_fails() {
        let fs = TestFs::new(4096).with_dir("tmp");
        let mut session = serve(fs).await;
        match session.read_file("/tmp").await {
            Err(error::Error::No(e)) => assert_eq!(e, EISDIR),
            other => panic!("expected EISDIR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn detach_releases_the_root() {
        let fs = TestFs::new(4096);
        let session = serve(fs).await;
        session.detach().await.unwrap();
    }
}
