//! Session ids and recovery tokens
//!
//! A recovery token binds a player id to one session. It is the hex encoding
//! of the claims followed by an HMAC-SHA256 tag over the claims keyed with
//! the server secret, so a token minted for one player cannot restore another.

use super::RecoveryError;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::PlayerId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub player_id: PlayerId,
    pub session_id: String,
    pub room_code: String,
    pub issued_at: u64,
    nonce: u64,
}

#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

pub fn new_session_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, claims: &[u8]) -> Result<HmacSha256, RecoveryError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| RecoveryError::TokenKey)?;
        mac.update(claims);
        Ok(mac)
    }

    pub fn issue<R: Rng + ?Sized>(
        &self,
        player_id: &str,
        session_id: &str,
        room_code: &str,
        issued_at: u64,
        rng: &mut R,
    ) -> Result<String, RecoveryError> {
        let claims = TokenClaims {
            player_id: player_id.to_string(),
            session_id: session_id.to_string(),
            room_code: room_code.to_string(),
            issued_at,
            nonce: rng.gen(),
        };
        let body = bincode::serialize(&claims)?;
        let tag = self.mac(&body)?.finalize().into_bytes();
        Ok(format!("{}.{}", hex::encode(&body), hex::encode(tag)))
    }

    /// Checks integrity and that the token belongs to `player_id`
    pub fn verify(&self, token: &str, player_id: &str) -> Result<TokenClaims, RecoveryError> {
        let (body_hex, mac_hex) = token.split_once('.').ok_or(RecoveryError::InvalidToken)?;
        let body = hex::decode(body_hex).map_err(|_| RecoveryError::InvalidToken)?;
        let mac = hex::decode(mac_hex).map_err(|_| RecoveryError::InvalidToken)?;

        self.mac(&body)?
            .verify_slice(&mac)
            .map_err(|_| RecoveryError::InvalidToken)?;

        let claims: TokenClaims =
            bincode::deserialize(&body).map_err(|_| RecoveryError::InvalidToken)?;
        if claims.player_id != player_id {
            return Err(RecoveryError::TokenPlayerMismatch {
                expected: player_id.to_string(),
                actual: claims.player_id,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_token_round_trip() {
        let signer = TokenSigner::new("secret");
        let mut rng = StdRng::seed_from_u64(1);
        let token = signer.issue("p1", "s1", "ROOM", 500, &mut rng).unwrap();

        let claims = signer.verify(&token, "p1").unwrap();
        assert_eq!(claims.session_id, "s1");
        assert_eq!(claims.room_code, "ROOM");
        assert_eq!(claims.issued_at, 500);
    }

    #[test]
    fn test_token_bound_to_player() {
        let signer = TokenSigner::new("secret");
        let mut rng = StdRng::seed_from_u64(1);
        let token = signer.issue("p1", "s1", "ROOM", 500, &mut rng).unwrap();

        assert!(matches!(
            signer.verify(&token, "p2"),
            Err(RecoveryError::TokenPlayerMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_or_foreign_token_rejected() {
        let signer = TokenSigner::new("secret");
        let mut rng = StdRng::seed_from_u64(1);
        let token = signer.issue("p1", "s1", "ROOM", 500, &mut rng).unwrap();

        let other = TokenSigner::new("another secret");
        assert!(matches!(other.verify(&token, "p1"), Err(RecoveryError::InvalidToken)));

        let mut tampered = token.clone();
        tampered.replace_range(0..2, "ff");
        assert!(matches!(signer.verify(&tampered, "p1"), Err(RecoveryError::InvalidToken)));
        assert!(matches!(signer.verify("garbage", "p1"), Err(RecoveryError::InvalidToken)));
    }

    #[test]
    fn test_truncated_tag_rejected() {
        let signer = TokenSigner::new("secret");
        let mut rng = StdRng::seed_from_u64(1);
        let token = signer.issue("p1", "s1", "ROOM", 500, &mut rng).unwrap();

        let (body, tag) = token.split_once('.').unwrap();
        assert_eq!(tag.len(), 64);
        let short = format!("{}.{}", body, &tag[..32]);
        assert!(matches!(signer.verify(&short, "p1"), Err(RecoveryError::InvalidToken)));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = new_session_id(&mut rng);
        let b = new_session_id(&mut rng);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
