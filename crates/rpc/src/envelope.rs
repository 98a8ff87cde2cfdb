use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire envelope for one request or reply.
///
/// The body is MessagePack (named fields, so tagged enums survive the trip).
/// A reply carries the correlation id of the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing topic, e.g. `drover.worker.run` or `drover.worker.run.reply`.
    pub topic: String,

    /// Matches replies to their requests.
    pub correlation_id: Uuid,

    pub sent_at: DateTime<Utc>,

    #[serde(with = "raw_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Start a new exchange with a fresh correlation id.
    pub fn request<T: Serialize>(
        topic: impl Into<String>,
        body: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            correlation_id: Uuid::new_v4(),
            sent_at: Utc::now(),
            body: rmp_serde::to_vec_named(body)?,
        })
    }

    /// Answer this envelope, keeping its correlation id.
    pub fn reply<T: Serialize>(
        &self,
        topic: impl Into<String>,
        body: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            correlation_id: self.correlation_id,
            sent_at: Utc::now(),
            body: rmp_serde::to_vec_named(body)?,
        })
    }

    pub fn decode_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Encode `Vec<u8>` as a MessagePack bin instead of an array of ints.
mod raw_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
