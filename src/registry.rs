use sha2::{Digest, Sha256};

use crate::error::{GameError, Result};
use crate::games::crazy_eights::{PlayerId, ADMIN};

pub const MAX_PLAYERS: usize = 10;
const MAX_NAME_LEN: usize = 32;

// Names that would clash with the game's own records
const RESERVED: [&str; 7] = [ADMIN, "deck", "discard", "turn", "users", "pending", "history"];

/// Read-only view the engine needs of the registered identities.
pub trait Registry {
    /// Non-admin identities in join order.
    fn players(&self) -> Vec<PlayerId>;
    fn authenticate(&self, id: &str, secret: &str) -> bool;
    fn exists(&self, id: &str) -> bool;
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn validate_name(name: &str) -> Result<()> {
    let well_formed = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !well_formed {
        return Err(GameError::InvalidUserName(name.to_string()));
    }
    if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(GameError::ReservedUserName(name.to_string()));
    }
    Ok(())
}

/// The `users` record: one `<identity>,<hash>` line per user, file order being
/// join order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserFile {
    users: Vec<(String, String)>,
}

impl UserFile {
    pub fn with_admin(secret: &str) -> Self {
        UserFile { users: vec![(ADMIN.to_string(), hash_secret(secret))] }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut users: Vec<(String, String)> = Vec::new();

        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (id, hash) = line
                .split_once(',')
                .ok_or_else(|| GameError::malformed("users", format!("expected <identity>,<hash>, found {:?}", line)))?;
            let (id, hash) = (id.trim(), hash.trim());
            if id.is_empty() || hash.is_empty() {
                return Err(GameError::malformed("users", format!("incomplete entry {:?}", line)));
            }
            if users.iter().any(|(known, _)| known == id) {
                return Err(GameError::malformed("users", format!("duplicate identity {}", id)));
            }
            users.push((id.to_string(), hash.to_string()));
        }

        Ok(UserFile { users })
    }

    pub fn encode(&self) -> String {
        self.users.iter().map(|(id, hash)| format!("{},{}\n", id, hash)).collect()
    }

    pub fn add(&mut self, name: &str, secret: &str) -> Result<()> {
        validate_name(name)?;
        // Hand records are files, which may clash on case-insensitive filesystems
        if self.users.iter().any(|(known, _)| known.eq_ignore_ascii_case(name)) {
            return Err(GameError::UserExists(name.to_string()));
        }
        if self.players().len() >= MAX_PLAYERS {
            return Err(GameError::TooManyUsers(MAX_PLAYERS));
        }

        self.users.push((name.to_string(), hash_secret(secret)));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case(ADMIN) {
            return Err(GameError::ReservedUserName(name.to_string()));
        }
        if !self.exists(name) {
            return Err(GameError::UnknownUser(name.to_string()));
        }

        self.users.retain(|(id, _)| id != name);
        Ok(())
    }

    /// Like `authenticate`, but tells an unknown identity apart from a bad
    /// secret.
    pub fn require(&self, id: &str, secret: &str) -> Result<()> {
        if !self.exists(id) {
            return Err(GameError::UnknownUser(id.to_string()));
        }
        if !self.authenticate(id, secret) {
            return Err(GameError::AuthenticationFailed(id.to_string()));
        }
        Ok(())
    }
}

impl Registry for UserFile {
    fn players(&self) -> Vec<PlayerId> {
        self.users
            .iter()
            .map(|(id, _)| id)
            .filter(|id| id.as_str() != ADMIN)
            .cloned()
            .collect()
    }

    fn authenticate(&self, id: &str, secret: &str) -> bool {
        let hashed = hash_secret(secret);
        self.users.iter().any(|(known, hash)| known == id && *hash == hashed)
    }

    fn exists(&self, id: &str) -> bool {
        self.users.iter().any(|(known, _)| known == id)
    }
}
