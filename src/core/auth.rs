//! Per-agent write credentials.
//!
//! Tokens are 32 random bytes from the OS CSPRNG, handed out hex-encoded and
//! stored only as SHA-256 digests. Verification hashes the presented token and
//! compares digests with a fixed-length constant-time loop, so neither storage
//! compromise nor timing reveals the secret. Credential issuance policy beyond
//! valid/invalid is out of scope here.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::store::Store;
use crate::core::time;
use rand::RngCore;
use rand::rngs::OsRng;
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

pub const TOKEN_BYTES: usize = 32;

fn digest_hex(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Issue (or rotate) the write token for an agent. Returns the plaintext
/// token exactly once; only the digest is persisted.
pub fn issue_token(store: &Store, agent_id: &str) -> Result<String, VigilError> {
    if agent_id.trim().is_empty() {
        return Err(VigilError::ValidationError(
            "agent id must be non-empty".to_string(),
        ));
    }
    let mut raw = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut raw);
    let token = hex::encode(raw);
    let digest = digest_hex(&token);

    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    broker.with_write(&db_path, agent_id, "auth.issue", |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO credentials(agent_id, token_digest, issued_at) VALUES(?1, ?2, ?3)",
            params![agent_id, digest, time::now_epoch_z()],
        )?;
        Ok(())
    })?;
    Ok(token)
}

/// Verify a presented token for an agent. Rejects before any state mutation;
/// a missing credential row and a wrong token are indistinguishable to the
/// caller.
pub fn verify_token(store: &Store, agent_id: &str, token: &str) -> Result<(), VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let stored: Option<String> = broker.with_read(&db_path, |conn| {
        conn.query_row(
            "SELECT token_digest FROM credentials WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(VigilError::RusqliteError)
    })?;

    let presented = digest_hex(token);
    let ok = match stored {
        Some(digest) => constant_time_eq(digest.as_bytes(), presented.as_bytes()),
        None => {
            // Burn the comparison anyway so absent and wrong cost the same.
            let zero = digest_hex("");
            constant_time_eq(zero.as_bytes(), presented.as_bytes()) && false
        }
    };
    if ok {
        Ok(())
    } else {
        Err(VigilError::AuthError(format!(
            "invalid or missing credential for agent '{}'",
            agent_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abcd", b"abc"));
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let d = digest_hex("token");
        assert_eq!(d.len(), 64);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
