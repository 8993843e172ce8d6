use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use openssl::hash::{MessageDigest, hash};
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST, HeaderName, HeaderValue};
use reqwest::{Method, Request};
use thiserror::Error;

use crate::config::AuthSource;

const X_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-content-sha256");
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const JSON: &str = "application/json";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key")]
    Key(#[source] ErrorStack),

    #[error("failed to sign request")]
    Crypto(#[from] ErrorStack),

    #[error("invalid header value for {0}")]
    Header(String),

    #[error("request has no host")]
    NoHost,
}

/// Signs requests with the OCI HTTP signature scheme (`rsa-sha256`).
pub struct RequestSigner {
    key_id: String,
    key: PKey<Private>,
}

impl RequestSigner {
    pub fn new(key_id: String, key: PKey<Private>) -> Self {
        Self { key_id, key }
    }

    /// Builds a signer from a resource principal session token and its
    /// private key. Either value may be an absolute path to a file holding it.
    pub fn resource_principal(rpst: &str, private_pem: &str, passphrase: Option<&str>) -> Result<Self, SignError> {
        let token = inline_or_file(rpst)?;
        let pem = inline_or_file(private_pem)?;
        let key = match passphrase {
            Some(pass) => PKey::private_key_from_pem_passphrase(pem.as_bytes(), pass.as_bytes()),
            None => PKey::private_key_from_pem(pem.as_bytes()),
        }
        .map_err(SignError::Key)?;

        Ok(Self::new(format!("ST${}", token.trim()), key))
    }

    /// Adds `date`, `host` and, for requests with a body, `content-type`,
    /// `content-length` and `x-content-sha256`, then the `Authorization`
    /// header signing all of them.
    pub fn sign(&self, request: &mut Request, now: DateTime<Utc>) -> Result<(), SignError> {
        let host = host_header(request)?;
        let target = request_target(request);
        let date = now.format(HTTP_DATE_FORMAT).to_string();

        let mut signed = vec![
            ("date", date.clone()),
            ("(request-target)", target),
            ("host", host.clone()),
        ];
        let mut extra = vec![(DATE, date), (HOST, host)];

        if [Method::POST, Method::PUT, Method::PATCH].contains(request.method()) {
            let body = request.body().and_then(|b| b.as_bytes()).unwrap_or_default();
            let digest = STANDARD.encode(hash(MessageDigest::sha256(), body)?);
            let content_type = request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(JSON)
                .to_string();

            signed.push(("content-length", body.len().to_string()));
            signed.push(("content-type", content_type.clone()));
            signed.push(("x-content-sha256", digest.clone()));
            extra.push((CONTENT_LENGTH, body.len().to_string()));
            extra.push((CONTENT_TYPE, content_type));
            extra.push((X_CONTENT_SHA256, digest));
        }

        let signature = self.signature(&signing_string(&signed))?;
        let header_names: Vec<&str> = signed.iter().map(|(name, _)| *name).collect();
        let authorization = format!(
            r#"Signature version="1",keyId="{}",algorithm="rsa-sha256",headers="{}",signature="{}""#,
            self.key_id,
            header_names.join(" "),
            signature
        );

        let headers = request.headers_mut();
        for (name, value) in extra {
            let value = HeaderValue::from_str(&value).map_err(|_| SignError::Header(name.to_string()))?;
            headers.insert(name, value);
        }
        let value = HeaderValue::from_str(&authorization).map_err(|_| SignError::Header(AUTHORIZATION.to_string()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn signature(&self, signing_string: &str) -> Result<String, ErrorStack> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.key)?;
        signer.update(signing_string.as_bytes())?;
        Ok(STANDARD.encode(signer.sign_to_vec()?))
    }
}

/// How outgoing API requests are authenticated.
#[derive(Clone)]
pub enum RequestAuth {
    Anonymous,
    Token(HeaderValue),
    Signed(Arc<RequestSigner>),
}

impl RequestAuth {
    pub fn from_source(source: &AuthSource) -> Result<Self, SignError> {
        Ok(match source {
            AuthSource::Anonymous => RequestAuth::Anonymous,
            AuthSource::Token(token) => {
                let mut value = HeaderValue::from_str(token).map_err(|_| SignError::Header(AUTHORIZATION.to_string()))?;
                value.set_sensitive(true);
                RequestAuth::Token(value)
            }
            AuthSource::ResourcePrincipal {
                rpst,
                private_pem,
                passphrase,
            } => RequestAuth::Signed(Arc::new(RequestSigner::resource_principal(
                rpst,
                private_pem,
                passphrase.as_deref(),
            )?)),
        })
    }

    pub fn apply(&self, request: &mut Request) -> Result<(), SignError> {
        match self {
            RequestAuth::Anonymous => Ok(()),
            RequestAuth::Token(value) => {
                request.headers_mut().insert(AUTHORIZATION, value.clone());
                Ok(())
            }
            RequestAuth::Signed(signer) => signer.sign(request, Utc::now()),
        }
    }
}

fn signing_string(headers: &[(&str, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn request_target(request: &Request) -> String {
    let url = request.url();
    let method = request.method().as_str().to_lowercase();
    match url.query() {
        Some(query) => format!("{method} {}?{query}", url.path()),
        None => format!("{method} {}", url.path()),
    }
}

fn host_header(request: &Request) -> Result<String, SignError> {
    let url = request.url();
    let host = url.host_str().ok_or(SignError::NoHost)?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn inline_or_file(value: &str) -> Result<String, SignError> {
    let path = Path::new(value);
    if !path.is_absolute() {
        return Ok(value.to_string());
    }
    std::fs::read_to_string(path).map_err(|source| SignError::Io {
        path: path.to_path_buf(),
        source,
    })
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::TimeZone;
    use openssl::sign::Verifier;

    use super::test_support::test_key;
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 8, 9, 10).unwrap()
    }

    fn authorization_params(request: &Request) -> Vec<(String, String)> {
        let header = request.headers()[AUTHORIZATION].to_str().unwrap();
        let params = header.strip_prefix("Signature ").unwrap();
        params
            .split(',')
            .map(|pair| {
                let (name, value) = pair.split_once('=').unwrap();
                (name.to_string(), value.trim_matches('"').to_string())
            })
            .collect()
    }

    fn param<'a>(params: &'a [(String, String)], name: &str) -> &'a str {
        &params.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn post_signature_covers_body_headers() {
        let key = test_key();
        let signer = RequestSigner::new("ST$token".to_string(), key.clone());
        let mut request = reqwest::Client::new()
            .post("https://telemetry-ingestion.eu-frankfurt-1.oraclecloud.com/20180401/metrics")
            .header(CONTENT_TYPE, JSON)
            .body(r#"{"a":1}"#)
            .build()
            .unwrap();

        signer.sign(&mut request, fixed_now()).unwrap();

        let headers = request.headers();
        assert_eq!(headers["date"], "Tue, 05 Mar 2024 08:09:10 GMT");
        assert_eq!(headers["host"], "telemetry-ingestion.eu-frankfurt-1.oraclecloud.com");
        assert_eq!(headers["content-length"], "7");
        assert_eq!(headers["x-content-sha256"], "AVq9f1zFei3ZS3WQ8ErYCEJzkF7jPsXOvq5iJ2qX+GI=");

        let params = authorization_params(&request);
        assert_eq!(param(&params, "version"), "1");
        assert_eq!(param(&params, "keyId"), "ST$token");
        assert_eq!(param(&params, "algorithm"), "rsa-sha256");
        assert_eq!(
            param(&params, "headers"),
            "date (request-target) host content-length content-type x-content-sha256"
        );

        let expected = "date: Tue, 05 Mar 2024 08:09:10 GMT\n\
                        (request-target): post /20180401/metrics\n\
                        host: telemetry-ingestion.eu-frankfurt-1.oraclecloud.com\n\
                        content-length: 7\n\
                        content-type: application/json\n\
                        x-content-sha256: AVq9f1zFei3ZS3WQ8ErYCEJzkF7jPsXOvq5iJ2qX+GI=";
        let signature = STANDARD.decode(param(&params, "signature")).unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key).unwrap();
        verifier.update(expected.as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn get_signature_covers_target_with_port_and_query() {
        let key = test_key();
        let signer = RequestSigner::new("ST$token".to_string(), key.clone());
        let mut request = reqwest::Client::new()
            .get("http://127.0.0.1:8080/20181201/functions/ocid1.fnfunc.test?fields=id")
            .build()
            .unwrap();

        signer.sign(&mut request, fixed_now()).unwrap();

        assert!(request.headers().get("x-content-sha256").is_none());
        let params = authorization_params(&request);
        assert_eq!(param(&params, "headers"), "date (request-target) host");

        let expected = "date: Tue, 05 Mar 2024 08:09:10 GMT\n\
                        (request-target): get /20181201/functions/ocid1.fnfunc.test?fields=id\n\
                        host: 127.0.0.1:8080";
        let signature = STANDARD.decode(param(&params, "signature")).unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key).unwrap();
        verifier.update(expected.as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn resource_principal_reads_token_and_key_files() {
        let pem = test_key().private_key_to_pem_pkcs8().unwrap();
        let mut pem_file = tempfile::NamedTempFile::new().unwrap();
        pem_file.write_all(&pem).unwrap();
        let mut rpst_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(rpst_file, "eyJhbGciOi.session.token").unwrap();

        let signer = RequestSigner::resource_principal(
            rpst_file.path().to_str().unwrap(),
            pem_file.path().to_str().unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(signer.key_id, "ST$eyJhbGciOi.session.token");

        let inline = RequestSigner::resource_principal("inline-token", std::str::from_utf8(&pem).unwrap(), None).unwrap();
        assert_eq!(inline.key_id, "ST$inline-token");
    }

    #[test]
    fn bad_key_material_is_rejected() {
        assert!(matches!(
            RequestSigner::resource_principal("t", "not a pem", None),
            Err(SignError::Key(_))
        ));
        assert!(matches!(
            RequestSigner::resource_principal("t", "/nonexistent/certbox/key.pem", None),
            Err(SignError::Io { .. })
        ));
    }

    #[test]
    fn token_auth_sets_authorization_verbatim() {
        let auth = RequestAuth::from_source(&AuthSource::Token("Bearer abc".to_string())).unwrap();
        let mut request = reqwest::Client::new().get("http://localhost/").build().unwrap();
        auth.apply(&mut request).unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer abc");
    }
}
