use serde::Deserialize;

use crate::db::{UserStore, UserTable};
use crate::protocol::{HttpCode, RequestHead};

/// Login and registration form body: `user=NAME&password=PWD`.
#[derive(Debug, Deserialize)]
struct CredentialForm {
    user: String,
    password: String,
}

/// Map a parsed request to the document-root-relative page it should be
/// answered with.
///
/// The first character after the last `/` selects a route: `0` register
/// page, `1` login page, `5`/`6`/`7` media pages, and for POST requests
/// `2` checks a login and `3` registers a user.
pub fn route(
    req: &RequestHead,
    users: &UserTable,
    db: Option<&mut dyn UserStore>,
) -> Result<String, HttpCode> {
    let url = req.url.split('?').next().unwrap_or_default();
    if url.split('/').any(|segment| segment == "..") {
        return Err(HttpCode::ForbiddenRequest);
    }

    let last_segment = url.rsplit('/').next().unwrap_or_default();
    let key = last_segment.bytes().next();

    if req.cgi && matches!(key, Some(b'2' | b'3')) {
        let form = req
            .body
            .as_deref()
            .and_then(|body| serde_urlencoded::from_str::<CredentialForm>(body).ok());
        let page = if key == Some(b'3') {
            register(form, users, db)
        } else {
            login(form, users)
        };
        return Ok(page.to_string());
    }

    let page = match key {
        Some(b'0') => "/register.html",
        Some(b'1') => "/log.html",
        Some(b'5') => "/picture.html",
        Some(b'6') => "/video.html",
        Some(b'7') => "/fans.html",
        _ => url,
    };
    Ok(page.to_string())
}

fn login(form: Option<CredentialForm>, users: &UserTable) -> &'static str {
    match form {
        Some(form) if users.check(&form.user, &form.password) => "/welcome.html",
        _ => "/logError.html",
    }
}

fn register(
    form: Option<CredentialForm>,
    users: &UserTable,
    db: Option<&mut dyn UserStore>,
) -> &'static str {
    let (Some(form), Some(db)) = (form, db) else {
        return "/registerError.html";
    };
    if form.user.is_empty() || users.contains(&form.user) {
        return "/registerError.html";
    }
    if users.register(db, &form.user, &form.password) {
        tracing::info!(user = %form.user, "registered user");
        "/log.html"
    } else {
        "/registerError.html"
    }
}
