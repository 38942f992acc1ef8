//! Script-execution challenge.
//!
//! The challenge page sets a cookie from script and navigates back to the
//! requested URL. The same cookie is also set on the response so a client
//! that skips the script assignment still carries it next time. No
//! server-side record is kept: the cookie is the whole state.

use crate::config::ChallengeConfig;
use crate::detectors::RequestContext;

/// A rendered challenge response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePage {
    /// HTML document
    pub body: String,
    /// `Set-Cookie` header value
    pub set_cookie: String,
}

/// Issues challenge pages and recognizes answered challenges.
#[derive(Debug, Clone)]
pub struct ChallengeIssuer {
    cookie_name: String,
    cookie_value: String,
    max_age_seconds: u64,
    script_delay_ms: u64,
    fallback_refresh_seconds: u64,
}

impl ChallengeIssuer {
    pub fn new(config: &ChallengeConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            cookie_value: config.cookie_value.clone(),
            max_age_seconds: config.cookie_max_age_seconds,
            script_delay_ms: config.script_delay_ms,
            fallback_refresh_seconds: config.fallback_refresh_seconds,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Whether the request carries the challenge cookie with its exact value.
    pub fn is_challenged(&self, ctx: &RequestContext) -> bool {
        ctx.cookie
            .as_deref()
            .and_then(|header| cookie_value(header, &self.cookie_name))
            .is_some_and(|value| value == self.cookie_value)
    }

    /// `Set-Cookie` value for the proof cookie.
    pub fn set_cookie_header(&self) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; SameSite=Lax",
            self.cookie_name, self.cookie_value, self.max_age_seconds
        )
    }

    /// Render the challenge page for a request. The page returns the client
    /// to the path and query it originally asked for.
    pub fn issue(&self, ctx: &RequestContext) -> ChallengePage {
        let destination = safe_destination(&ctx.path);

        let js_destination = js_string(destination);
        let js_cookie = js_string(&format!(
            "{}={}; path=/; max-age={}; samesite=lax",
            self.cookie_name, self.cookie_value, self.max_age_seconds
        ));
        let refresh = html_escape::encode_safe(&format!(
            "{}; url={}",
            self.fallback_refresh_seconds, destination
        ))
        .into_owned();

        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex, nofollow">
<title>Loading...</title>
<noscript><meta http-equiv="refresh" content="{refresh}"></noscript>
</head>
<body>
<script>
document.cookie = {js_cookie};
setTimeout(function () {{ window.location.replace({js_destination}); }}, {delay});
</script>
</body>
</html>
"#,
            refresh = refresh,
            js_cookie = js_cookie,
            js_destination = js_destination,
            delay = self.script_delay_ms,
        );

        ChallengePage {
            body,
            set_cookie: self.set_cookie_header(),
        }
    }
}

impl Default for ChallengeIssuer {
    fn default() -> Self {
        Self::new(&ChallengeConfig::default())
    }
}

/// Value of cookie `name` in a `Cookie` header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k.trim() == name).then(|| v.trim())
    })
}

/// Keep the destination on this origin; anything else returns to `/`.
fn safe_destination(path: &str) -> &str {
    if path.starts_with('/') && !path.starts_with("//") && !path.contains('\\') {
        path
    } else {
        "/"
    }
}

/// A JavaScript string literal that is also safe inside `<script>`.
fn js_string(value: &str) -> String {
    serde_json::Value::from(value)
        .to_string()
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('&', "\\u0026")
}
