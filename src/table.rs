// The session table.
//
// Holds at most one session per client key. Replacing or removing a session through the table
// releases the stream it owns.

use crate::session::{ClientKey, TransferSession};
use std::collections::hash_map;
use std::collections::HashMap;

/// Maps each client key to its one active session.
///
/// The table is owned by the dispatcher and only reachable through `&mut`, so a lookup, insert or
/// remove for a key can never interleave with the handling of another packet or with the
/// retransmit sweep.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<ClientKey, TransferSession>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn lookup(&self, key: &ClientKey) -> Option<&TransferSession> {
        self.sessions.get(key)
    }

    pub fn lookup_mut(&mut self, key: &ClientKey) -> Option<&mut TransferSession> {
        self.sessions.get_mut(key)
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Stores `session` under `key`. A session already held for that key is released first; a
    /// client restarting its request always wins.
    pub async fn insert(&mut self, key: ClientKey, session: TransferSession) {
        if let Some(prior) = self.sessions.insert(key, session) {
            if !matches!(prior, TransferSession::Aborted(_)) {
                log::info!("Replacing {} session with {key}", prior.kind());
            }
            prior.close().await;
        }
    }

    /// Takes the session out of the table without releasing it.
    pub fn remove(&mut self, key: &ClientKey) -> Option<TransferSession> {
        self.sessions.remove(key)
    }

    /// Removes and releases the session for `key`. Returns whether there was one.
    pub async fn discard(&mut self, key: &ClientKey) -> bool {
        match self.sessions.remove(key) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Releases every session.
    pub async fn clear(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn iter_mut(&mut self) -> hash_map::IterMut<'_, ClientKey, TransferSession> {
        self.sessions.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AbortedSession, ReadSession, WriteSession};
    use crate::tftp::FileMode;
    use std::io::Cursor;
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio::time::Instant;

    fn key(port: u16) -> ClientKey {
        ([10, 0, 0, 1], port).into()
    }

    fn read(port: u16, contents: &[u8]) -> TransferSession {
        TransferSession::Read(ReadSession::new(
            key(port),
            Box::new(Cursor::new(contents.to_vec())),
            contents.len() as u64,
            FileMode::Octet,
        ))
    }

    #[tokio::test]
    async fn test_one_session_per_key() {
        let mut table = SessionTable::new();
        table.insert(key(1000), read(1000, b"first")).await;
        table.insert(key(1000), read(1000, b"second, longer")).await;
        table.insert(key(1001), read(1001, b"other")).await;

        assert_eq!(table.len(), 2);
        match table.lookup(&key(1000)) {
            Some(TransferSession::Read(s)) => assert_eq!(s.len(), 14),
            other => panic!("expected the replacing read session, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_address_different_port_is_distinct() {
        let mut table = SessionTable::new();
        table.insert(key(2000), read(2000, b"a")).await;
        assert!(table.contains(&key(2000)));
        assert!(!table.contains(&key(2001)));
        assert!(table.lookup(&"10.0.0.2:2000".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_replacing_write_session_flushes_sink() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("upload.bin");
        let file = File::create(&path).await.unwrap();
        let mut write = WriteSession::new(key(3000), Box::new(file), FileMode::Octet);
        let _ = write.process_data(1, &[0x07; 512]).await;

        let mut table = SessionTable::new();
        table.insert(key(3000), TransferSession::Write(write)).await;
        table.insert(key(3000), read(3000, b"restart")).await;

        assert_eq!(std::fs::read(&path).unwrap(), vec![0x07; 512]);
        assert!(matches!(table.lookup(&key(3000)), Some(TransferSession::Read(_))));
    }

    #[tokio::test]
    async fn test_remove_and_discard() {
        let mut table = SessionTable::new();
        table.insert(key(4000), read(4000, b"x")).await;
        table
            .insert(key(4001), TransferSession::Aborted(AbortedSession::new(Instant::now())))
            .await;

        assert!(matches!(table.remove(&key(4000)), Some(TransferSession::Read(_))));
        assert!(table.remove(&key(4000)).is_none());
        assert!(table.discard(&key(4001)).await);
        assert!(!table.discard(&key(4001)).await);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_clear_releases_everything() {
        let mut table = SessionTable::new();
        for port in 5000..5010 {
            table.insert(key(port), read(port, b"data")).await;
        }
        assert_eq!(table.len(), 10);
        table.clear().await;
        assert!(table.is_empty());
        assert!(table.lookup_mut(&key(5000)).is_none());
    }
}
