//! Request signing for the [`RestAuth`] types.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use http::{header, HeaderName};
use rand::RngCore;
use relaykit_core::config::RestAuth;
use sha1::{Digest, Sha1};

pub const WSSE_HEADER: HeaderName = HeaderName::from_static("x-wsse");
const WSSE_AUTHORIZATION: &str = "WSSE profile=\"UsernameToken\"";

/// Headers that sign one request. Empty without auth or with incomplete credentials.
pub fn auth_headers(auth: &RestAuth) -> Vec<(HeaderName, String)> {
    if auth.is_logged_out() {
        return Vec::new();
    }
    match auth {
        RestAuth::NoAuth => Vec::new(),
        RestAuth::Basic {
            user_name,
            password,
        } => vec![(header::AUTHORIZATION, basic_credentials(user_name, password))],
        RestAuth::Wsse {
            user_name,
            password,
        } => {
            let mut nonce = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut nonce);
            let created = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            vec![
                (header::AUTHORIZATION, WSSE_AUTHORIZATION.to_string()),
                (WSSE_HEADER, wsse_token(user_name, password, &nonce, &created)),
            ]
        }
        RestAuth::BearerToken { token } => {
            vec![(header::AUTHORIZATION, format!("Bearer {token}"))]
        }
    }
}

fn basic_credentials(user_name: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user_name}:{password}")))
}

/// UsernameToken with `PasswordDigest = base64(sha1(nonce + created + password))`.
fn wsse_token(user_name: &str, password: &str, nonce: &[u8], created: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    let digest = STANDARD.encode(hasher.finalize());
    format!(
        "UsernameToken Username=\"{user_name}\", PasswordDigest=\"{digest}\", Nonce=\"{}\", Created=\"{created}\"",
        STANDARD.encode(nonce)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let auth = RestAuth::Basic {
            user_name: "alice".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(
            vec![(header::AUTHORIZATION, "Basic YWxpY2U6c2VjcmV0".to_string())],
            auth_headers(&auth)
        );
    }

    #[test]
    fn test_bearer_token() {
        let auth = RestAuth::BearerToken {
            token: "abc".to_string(),
        };
        assert_eq!(
            vec![(header::AUTHORIZATION, "Bearer abc".to_string())],
            auth_headers(&auth)
        );
    }

    #[test]
    fn test_wsse() {
        assert_eq!(
            "UsernameToken Username=\"alice\", PasswordDigest=\"W+AMPWIcgBDGW9XpBeBhrAdNo+g=\", \
             Nonce=\"MDEyMzQ1Njc4OWFiY2RlZg==\", Created=\"2024-01-01T00:00:00Z\"",
            wsse_token("alice", "secret", b"0123456789abcdef", "2024-01-01T00:00:00Z")
        );

        let auth = RestAuth::Wsse {
            user_name: "alice".to_string(),
            password: "secret".to_string(),
        };
        let headers = auth_headers(&auth);
        assert_eq!(2, headers.len());
        assert_eq!((header::AUTHORIZATION, WSSE_AUTHORIZATION.to_string()), headers[0]);
        assert_eq!(WSSE_HEADER, headers[1].0);
        assert!(headers[1].1.starts_with("UsernameToken Username=\"alice\""));
    }

    #[test]
    fn test_incomplete_credentials_sign_nothing() {
        assert!(auth_headers(&RestAuth::NoAuth).is_empty());
        let auth = RestAuth::Basic {
            user_name: "alice".to_string(),
            password: String::new(),
        };
        assert!(auth_headers(&auth).is_empty());
        let auth = RestAuth::BearerToken {
            token: String::new(),
        };
        assert!(auth_headers(&auth).is_empty());
    }
}
