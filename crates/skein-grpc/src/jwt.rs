use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;

use crate::grpc::error::GrpcError;

/// Signs `skein.encodeJWT` payloads with the worker's shared secret.
#[derive(Clone)]
pub struct JwtSigner {
    key: EncodingKey,
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner").field("key", &"<redacted>").finish()
    }
}

impl JwtSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Only HMAC algorithms are accepted; an empty name means HS256.
    pub fn encode(&self, payload: &Value, algorithm: &str) -> Result<String, GrpcError> {
        let algorithm = match algorithm.trim().to_ascii_uppercase().as_str() {
            "" | "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            _ => return Err(GrpcError::JwtAlgorithm(algorithm.to_string())),
        };
        Ok(jsonwebtoken::encode(&Header::new(algorithm), payload, &self.key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use serde_json::json;

    #[test]
    fn test_tokens_verify_with_the_same_secret() {
        let signer = JwtSigner::new("s3cret");
        let token = signer
            .encode(&json!({"sub": "runner-1", "exp": 4_102_444_800u64}), "HS384")
            .unwrap();
        assert_eq!(token.split('.').count(), 3);

        let decoded = decode::<Value>(
            &token,
            &DecodingKey::from_secret(b"s3cret"),
            &Validation::new(Algorithm::HS384),
        )
        .unwrap();
        assert_eq!(decoded.claims["sub"], "runner-1");
        assert_eq!(decoded.header.alg, Algorithm::HS384);
    }

    #[test]
    fn test_asymmetric_algorithms_are_rejected() {
        let signer = JwtSigner::new("s3cret");
        assert!(matches!(
            signer.encode(&json!({}), "RS256"),
            Err(GrpcError::JwtAlgorithm(_))
        ));
        assert!(signer.encode(&json!({"a": 1}), "").is_ok());
    }
}
