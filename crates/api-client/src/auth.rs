use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

// Create a type alias for the HMAC-SHA256 implementation.
type HmacSha256 = Hmac<Sha256>;

/// Builds the string Bitget signs: `timestamp + METHOD + requestPath + body`.
///
/// `request_path` already includes `?query` for GET requests; `body` is empty
/// for them.
pub fn prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    let mut message =
        String::with_capacity(timestamp.len() + method.len() + request_path.len() + body.len());
    message.push_str(timestamp);
    message.push_str(&method.to_uppercase());
    message.push_str(request_path);
    message.push_str(body);
    message
}

/// Creates the `ACCESS-SIGN` header value: base64(HMAC-SHA256(prehash, secret)).
pub fn sign_request(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(prehash(timestamp, method, request_path, body).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_is_uppercased_in_prehash() {
        assert_eq!(
            prehash("1", "get", "/api/v2/mix/account/accounts?productType=USDT-FUTURES", ""),
            "1GET/api/v2/mix/account/accounts?productType=USDT-FUTURES"
        );
    }

    #[test]
    fn signs_get_with_query() {
        let signature = sign_request(
            "secret",
            "1700000000000",
            "GET",
            "/api/v2/mix/account/accounts?productType=USDT-FUTURES",
            "",
        );
        assert_eq!(signature, "n3kHTP7IOoneFzjsuyF3xwNNR4yjiwprgGfqZHfwLJ4=");
    }

    #[test]
    fn signs_post_with_body() {
        let signature = sign_request(
            "secret",
            "1700000000000",
            "POST",
            "/api/v2/mix/order/place-order",
            r#"{"symbol":"BTCUSDT"}"#,
        );
        assert_eq!(signature, "C/vSpmkAdkJHFrpOiYGEkV5HK8LKTTJ44CrlBsnfknQ=");
    }
}
