//! C14 — API-key / Basic / Bearer authentication and rule-based authorization.
//!
//! New relative to the teacher (no auth filter existed upstream); grounded
//! on the pack's kairos-rs-style auth-middleware layering and on
//! `routing/mod.rs`'s `CompiledHeaderMatcher`/pattern idiom for
//! `accessRule.pathPattern` matching. JWT signature verification is
//! explicitly out of scope per spec §4.C14/§9 — bearer tokens are looked up
//! as opaque strings against configured credentials, same as API keys.

use crate::config::{AccessRule, AuthConfig, CredentialEntry};
use crate::error::GatewayError;
use base64::Engine;
use http::HeaderMap;

use super::FilterResult;

pub struct AuthenticatedUser {
    pub user_id: String,
    pub roles: Vec<String>,
}

/// Tries configured methods in order; first success wins.
pub fn authenticate(auth: &AuthConfig, headers: &HeaderMap) -> Option<AuthenticatedUser> {
    for method in &auth.methods {
        let found = match method.as_str() {
            "api_key" => authenticate_api_key(auth, headers),
            "basic" => authenticate_basic(auth, headers),
            "bearer" => authenticate_bearer(auth, headers),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn find_credential<'a>(auth: &'a AuthConfig, kind: &str, secret: &str) -> Option<&'a CredentialEntry> {
    auth.credentials.iter().find(|c| c.kind == kind && c.secret == secret)
}

fn authenticate_api_key(auth: &AuthConfig, headers: &HeaderMap) -> Option<AuthenticatedUser> {
    let key = headers.get("x-api-key")?.to_str().ok()?;
    let cred = find_credential(auth, "api_key", key)?;
    Some(AuthenticatedUser {
        user_id: cred.user_id.clone(),
        roles: cred.roles.clone(),
    })
}

fn authenticate_basic(auth: &AuthConfig, headers: &HeaderMap) -> Option<AuthenticatedUser> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let cred = find_credential(auth, "basic", &decoded)?;
    Some(AuthenticatedUser {
        user_id: cred.user_id.clone(),
        roles: cred.roles.clone(),
    })
}

fn authenticate_bearer(auth: &AuthConfig, headers: &HeaderMap) -> Option<AuthenticatedUser> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    let cred = find_credential(auth, "bearer", token)?;
    Some(AuthenticatedUser {
        user_id: cred.user_id.clone(),
        roles: cred.roles.clone(),
    })
}

fn path_pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    pattern == path
}

fn rule_applies(rule: &AccessRule, path: &str, method: &http::Method) -> bool {
    if !path_pattern_matches(&rule.path_pattern, path) {
        return false;
    }
    rule.methods.is_empty()
        || rule.methods.iter().any(|m| m == "*" || m.eq_ignore_ascii_case(method.as_str()))
}

/// Walk `accessRules` in order; first matching rule decides. No matching
/// rule denies, per spec §4.C14.
pub fn authorize(
    auth: &AuthConfig,
    path: &str,
    method: &http::Method,
    user: &Option<AuthenticatedUser>,
) -> FilterResult {
    for rule in &auth.access_rules {
        if !rule_applies(rule, path, method) {
            continue;
        }
        if rule.public {
            return FilterResult::Continue;
        }
        let Some(user) = user else {
            return FilterResult::Fail(GatewayError::Unauthenticated);
        };
        let allowed = rule.required_roles.is_empty()
            || rule.required_roles.iter().any(|r| r == "*" || user.roles.iter().any(|ur| ur == r));
        return if allowed {
            FilterResult::Continue
        } else {
            FilterResult::Fail(GatewayError::Unauthorized)
        };
    }
    FilterResult::Fail(GatewayError::Unauthorized)
}

/// Strip inbound credential headers before forwarding upstream, per spec §4.C14.
pub fn strip_credential_headers(headers: &mut HeaderMap) {
    headers.remove(http::header::AUTHORIZATION);
    headers.remove("x-api-key");
}

pub fn inject_user_headers(headers: &mut HeaderMap, user: &AuthenticatedUser) {
    if let Ok(v) = http::HeaderValue::from_str(&user.user_id) {
        headers.insert("x-authenticated-user-id", v);
    }
    if let Ok(v) = http::HeaderValue::from_str(&user.roles.join(",")) {
        headers.insert("x-authenticated-user-roles", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialEntry;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            methods: vec!["api_key".into(), "basic".into(), "bearer".into()],
            credentials: vec![
                CredentialEntry {
                    kind: "api_key".into(),
                    secret: "secret123".into(),
                    user_id: "svc-a".into(),
                    roles: vec!["reader".into()],
                },
                CredentialEntry {
                    kind: "bearer".into(),
                    secret: "tok-abc".into(),
                    user_id: "svc-b".into(),
                    roles: vec!["admin".into()],
                },
            ],
            access_rules: vec![
                AccessRule {
                    path_pattern: "/public/*".into(),
                    methods: vec![],
                    public: true,
                    required_roles: vec![],
                },
                AccessRule {
                    path_pattern: "/admin/*".into(),
                    methods: vec![],
                    public: false,
                    required_roles: vec!["admin".into()],
                },
            ],
        }
    }

    #[test]
    fn api_key_header_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", http::HeaderValue::from_static("secret123"));
        let user = authenticate(&auth_config(), &headers).unwrap();
        assert_eq!(user.user_id, "svc-a");
    }

    #[test]
    fn bearer_token_authenticates() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, http::HeaderValue::from_static("Bearer tok-abc"));
        let user = authenticate(&auth_config(), &headers).unwrap();
        assert_eq!(user.user_id, "svc-b");
    }

    #[test]
    fn unknown_credentials_fail_all_methods() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, http::HeaderValue::from_static("Bearer nope"));
        assert!(authenticate(&auth_config(), &headers).is_none());
    }

    #[test]
    fn public_rule_allows_without_auth() {
        let cfg = auth_config();
        let result = authorize(&cfg, "/public/info", &http::Method::GET, &None);
        assert!(matches!(result, FilterResult::Continue));
    }

    #[test]
    fn admin_rule_denies_unauthenticated() {
        let cfg = auth_config();
        let result = authorize(&cfg, "/admin/users", &http::Method::GET, &None);
        assert!(matches!(result, FilterResult::Fail(GatewayError::Unauthenticated)));
    }

    #[test]
    fn admin_rule_denies_wrong_role() {
        let cfg = auth_config();
        let user = Some(AuthenticatedUser {
            user_id: "svc-a".into(),
            roles: vec!["reader".into()],
        });
        let result = authorize(&cfg, "/admin/users", &http::Method::GET, &user);
        assert!(matches!(result, FilterResult::Fail(GatewayError::Unauthorized)));
    }

    #[test]
    fn admin_rule_allows_matching_role() {
        let cfg = auth_config();
        let user = Some(AuthenticatedUser {
            user_id: "svc-b".into(),
            roles: vec!["admin".into()],
        });
        let result = authorize(&cfg, "/admin/users", &http::Method::GET, &user);
        assert!(matches!(result, FilterResult::Continue));
    }

    #[test]
    fn no_matching_rule_denies() {
        let cfg = auth_config();
        let result = authorize(&cfg, "/unlisted", &http::Method::GET, &None);
        assert!(matches!(result, FilterResult::Fail(GatewayError::Unauthorized)));
    }
}
