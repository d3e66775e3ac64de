//! One-time association tokens.
//!
//! When a reliable connection is admitted the server issues a random token over
//! that connection. The client echoes it as the first datagram on the
//! best-effort port, which binds the datagram's source address to the session.
//!
//! A token is redeemable exactly once and only within its TTL. Redemption is an
//! atomic remove, so a replayed token always fails.

use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Characters a token is drawn from
pub const TOKEN_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890!@#$%^&*()_+-=[]{};':\",.<>/?\\";

/// Random token of `length` characters from [`TOKEN_ALPHABET`]
pub fn generate_token(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct PendingToken {
    session_id: u64,
    issued: Instant,
}

/// Tokens issued but not yet redeemed
#[derive(Debug)]
pub struct PendingTokens {
    entries: DashMap<String, PendingToken>,
    ttl: Duration,
}

impl PendingTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record `token` as issued to `session_id`
    pub fn insert(&self, token: String, session_id: u64) {
        self.entries.insert(
            token,
            PendingToken {
                session_id,
                issued: Instant::now(),
            },
        );
    }

    /// Redeem `token`, returning the session it was issued to.
    ///
    /// Unknown, already redeemed and expired tokens all yield `None`. An
    /// expired token stays in the table so [`cleanup`](Self::cleanup) can
    /// report its session.
    #[instrument(skip_all)]
    pub fn take(&self, token: &str) -> Option<u64> {
        let ttl = self.ttl;
        match self
            .entries
            .remove_if(token, |_, pending| pending.issued.elapsed() <= ttl)
        {
            Some((_, pending)) => Some(pending.session_id),
            None => {
                if let Some(pending) = self.entries.get(token) {
                    debug!(session_id = pending.session_id, "Token expired before redemption");
                }
                None
            }
        }
    }

    /// Withdraw a token without redeeming it
    pub fn remove(&self, token: &str) {
        self.entries.remove(token);
    }

    /// Drop expired tokens, returning the sessions they were issued to
    pub fn cleanup(&self) -> Vec<u64> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.entries.retain(|_, pending| {
            let live = pending.issued.elapsed() <= ttl;
            if !live {
                expired.push(pending.session_id);
            }
            live
        });
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Expired tokens cleaned up");
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_token_length_and_alphabet() {
        let token = generate_token(128);
        assert_eq!(token.chars().count(), 128);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_tokens_do_not_repeat() {
        let tokens: HashSet<_> = (0..1000).map(|_| generate_token(32)).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[tokio::test]
    async fn test_token_redeems_once() {
        let pending = PendingTokens::new(Duration::from_secs(30));
        pending.insert("secret".into(), 7);
        assert_eq!(pending.take("secret"), Some(7));
        assert_eq!(pending.take("secret"), None);
        assert_eq!(pending.take("never-issued"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_refused() {
        let pending = PendingTokens::new(Duration::from_secs(30));
        pending.insert("late".into(), 1);
        pending.insert("later".into(), 2);
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(pending.take("late"), None);
        let mut expired = pending.cleanup();
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_live_tokens() {
        let pending = PendingTokens::new(Duration::from_secs(30));
        pending.insert("old".into(), 1);
        tokio::time::advance(Duration::from_secs(20)).await;
        pending.insert("fresh".into(), 2);
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(pending.cleanup(), vec![1]);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.take("fresh"), Some(2));
    }
}
