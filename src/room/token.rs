//! Agent access tokens.
//!
//! An HS256 JWT signed with the room service's API secret. The issuer is the API key,
//! the subject is the agent identity, and a `video` grant scopes it to one room.

use crate::error::RoomError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room_join: bool,
    pub room: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub name: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
}

pub struct AccessToken<'a> {
    api_key: &'a str,
    api_secret: &'a str,
    identity: &'a str,
    ttl: Duration,
}

impl<'a> AccessToken<'a> {
    pub fn new(api_key: &'a str, api_secret: &'a str, identity: &'a str) -> Self {
        Self {
            api_key,
            api_secret,
            identity,
            ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Claims for an agent that joins `room`, publishes its voice and subscribes to
    /// everyone else.
    pub fn claims(&self, room: &str, now: i64) -> Claims {
        Claims {
            iss: self.api_key.to_string(),
            sub: self.identity.to_string(),
            name: self.identity.to_string(),
            nbf: now,
            exp: now + self.ttl.as_secs() as i64,
            video: VideoGrant {
                room_join: true,
                room: room.to_string(),
                can_publish: true,
                can_subscribe: true,
            },
        }
    }

    pub fn to_jwt(&self, room: &str) -> Result<String, RoomError> {
        let claims = self.claims(room, chrono::Utc::now().timestamp());
        sign(&claims, self.api_secret)
    }
}

fn sign(claims: &Claims, secret: &str) -> Result<String, RoomError> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = serde_json::to_vec(claims).map_err(|e| RoomError::Token(e.to_string()))?;
    let signing_input = format!("{}.{}", header, URL_SAFE_NO_PAD.encode(payload));

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RoomError::Token(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}
