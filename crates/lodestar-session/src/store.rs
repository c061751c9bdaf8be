//! Player persistence seam.
//!
//! Lodestar doesn't care where player accounts live. The [`PlayerStore`]
//! trait is the only thing the auth service talks to; plug in a database
//! in production and [`MemoryPlayerStore`] everywhere else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lodestar_protocol::{PlayerId, PlayerInfo};

use crate::StoreError;

/// A stored player account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub username: String,
    /// Opaque output of a [`PasswordHasher`](crate::PasswordHasher).
    pub password_hash: String,
    pub created_at: SystemTime,
    pub last_seen: Option<SystemTime>,
}

impl PlayerRecord {
    /// The client-facing view of this account.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.id,
            username: self.username.clone(),
        }
    }
}

/// Fields needed to create a player.
#[derive(Debug, Clone)]
pub struct NewPlayer {
    pub username: String,
    pub password_hash: String,
}

/// Where player accounts live.
///
/// Implementations must make `create` atomic with respect to username
/// uniqueness: two concurrent creates of the same name yield exactly one
/// success and one [`StoreError::Duplicate`].
#[async_trait]
pub trait PlayerStore: Send + Sync + 'static {
    /// Finds a player by username.
    async fn find_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError>;

    /// Creates a player and assigns it a fresh id.
    async fn create(&self, player: NewPlayer) -> Result<PlayerRecord, StoreError>;

    /// Records that the player was just seen.
    async fn update_last_seen(&self, player_id: PlayerId) -> Result<(), StoreError>;
}

/// An in-memory [`PlayerStore`].
///
/// Usernames are unique case-insensitively ("Alice" and "alice" are the
/// same account). Ids are handed out from a counter starting at 1.
#[derive(Debug)]
pub struct MemoryPlayerStore {
    players: DashMap<String, PlayerRecord>,
    next_id: AtomicU64,
}

impl MemoryPlayerStore {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored accounts.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

impl Default for MemoryPlayerStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(username: &str) -> String {
    username.to_lowercase()
}

#[async_trait]
impl PlayerStore for MemoryPlayerStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self.players.get(&key(username)).map(|record| record.clone()))
    }

    async fn create(&self, player: NewPlayer) -> Result<PlayerRecord, StoreError> {
        match self.players.entry(key(&player.username)) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(player.username)),
            Entry::Vacant(slot) => {
                let record = PlayerRecord {
                    id: PlayerId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                    username: player.username,
                    password_hash: player.password_hash,
                    created_at: SystemTime::now(),
                    last_seen: None,
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn update_last_seen(&self, player_id: PlayerId) -> Result<(), StoreError> {
        let mut found = self
            .players
            .iter_mut()
            .find(|record| record.id == player_id)
            .ok_or(StoreError::NotFound(player_id))?;
        found.last_seen = Some(SystemTime::now());
        Ok(())
    }
}
