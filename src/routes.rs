use std::convert::Infallible;
use std::sync::Arc;

use cookie::{Cookie, SameSite};
use log::{debug, error};
use serde::de::DeserializeOwned;
use warp::http::{header, StatusCode};
use warp::hyper::body::Bytes;
use warp::reply::{self, Reply, Response};
use warp::{Filter, Rejection};

use crate::api;
use crate::auth::SessionToken;
use crate::coin::{self, TmsaCoin};

pub const SESSION_COOKIE: &str = "tmsacoin-session";

const MAX_BODY: u64 = 16 * 1024;

pub fn routes(
    coin: Arc<TmsaCoin>,
    secure: bool,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let new_account = warp::path!("tmsacoin" / "api" / "new_account")
        .and(warp::post())
        .and(with(Arc::clone(&coin)))
        .and(json_body())
        .and(cookie_token())
        .and_then(new_account);

    let mint = warp::path!("tmsacoin" / "api" / "mint")
        .and(warp::post())
        .and(with(Arc::clone(&coin)))
        .and(json_body())
        .and(cookie_token())
        .and_then(mint);

    let transfer = warp::path!("tmsacoin" / "api" / "transfer")
        .and(warp::post())
        .and(with(Arc::clone(&coin)))
        .and(json_body())
        .and(cookie_token())
        .and_then(transfer);

    let login = warp::path!("tmsacoin" / "api" / "login")
        .and(warp::post())
        .and(with(Arc::clone(&coin)))
        .and(with(secure))
        .and(json_body())
        .and_then(login);

    let logout = warp::path!("tmsacoin" / "api" / "logout")
        .and(warp::post())
        .and(with(Arc::clone(&coin)))
        .and(with(secure))
        .and(token_body())
        .and(cookie_token())
        .and_then(logout);

    let balance = {
        let own = warp::path!("tmsacoin" / "api" / "balance")
            .and(warp::get())
            .and(with(Arc::clone(&coin)))
            .and(cookie_token())
            .and_then(own_balance);

        let of_user = warp::path!("tmsacoin" / "api" / "balance" / String)
            .and(warp::get())
            .and(with(Arc::clone(&coin)))
            .and_then(user_balance);

        own.or(of_user)
    };

    let history = warp::path!("tmsacoin" / "api" / "history")
        .and(warp::get())
        .and(with(Arc::clone(&coin)))
        .and(cookie_token())
        .and_then(history);

    let check_session = warp::path!("tmsacoin" / "api" / "check_session")
        .and(warp::post())
        .and(with(coin))
        .and(token_body())
        .and(cookie_token())
        .and_then(check_session);

    new_account
        .or(mint)
        .or(transfer)
        .or(login)
        .or(logout)
        .or(balance)
        .or(history)
        .or(check_session)
        .recover(recover)
        .with(warp::log("tmsacoin"))
}

fn with<T>(value: T) -> impl Filter<Extract = (T,), Error = Infallible> + Clone
where
    T: Clone + Send + Sync + 'static,
{
    warp::any().map(move || value.clone())
}

fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: DeserializeOwned + Send,
{
    warp::body::content_length_limit(MAX_BODY).and(warp::body::json())
}

/// `{token?}`, where an empty body means no token.
fn token_body() -> impl Filter<Extract = (api::TokenOnly,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY)
        .and(warp::body::bytes())
        .and_then(|body: Bytes| async move {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(api::TokenOnly::default());
            }
            serde_json::from_slice(&body).map_err(|e| {
                debug!("bad token body: {e}");
                reject(coin::Error::BadRequest("Request body is not valid JSON".into()))
            })
        })
}

fn cookie_token() -> impl Filter<Extract = (Option<SessionToken>,), Error = Infallible> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .map(|cookie: Option<String>| cookie.and_then(|c| c.parse().ok()))
}

/// The body's token wins over the cookie. A malformed token names no session,
/// so the caller is anonymous.
fn presented_token(body: Option<&str>, cookie: Option<SessionToken>) -> Option<SessionToken> {
    match body {
        Some(raw) => raw.parse().ok(),
        None => cookie,
    }
}

fn reject(e: coin::Error) -> Rejection {
    warp::reject::custom(e)
}

fn success() -> Response {
    reply::json(&api::Outcome::ok()).into_response()
}

fn session_cookie(value: String, max_age: u64, secure: bool) -> Cookie<'static> {
    let max_age = i64::try_from(max_age).unwrap_or(i64::MAX);

    Cookie::build((SESSION_COOKIE, value))
        .max_age(cookie::time::Duration::seconds(max_age))
        .same_site(SameSite::Strict)
        .path("/")
        .http_only(true)
        .secure(secure)
        .build()
}

async fn new_account(
    coin: Arc<TmsaCoin>,
    req: api::NewAccount,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let token = presented_token(req.token.as_deref(), cookie);
    let caller = coin.caller(token.as_ref()).await.map_err(reject)?;

    coin.new_account(&caller, req).await.map_err(reject)?;
    Ok(success())
}

async fn mint(
    coin: Arc<TmsaCoin>,
    req: api::Mint,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let token = presented_token(req.token.as_deref(), cookie);
    let caller = coin.caller(token.as_ref()).await.map_err(reject)?;

    coin.mint(&caller, req).await.map_err(reject)?;
    Ok(success())
}

async fn transfer(
    coin: Arc<TmsaCoin>,
    req: api::Transfer,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let token = presented_token(req.token.as_deref(), cookie);
    let caller = coin.caller(token.as_ref()).await.map_err(reject)?;

    coin.transfer(&caller, req).await.map_err(reject)?;
    Ok(success())
}

async fn login(
    coin: Arc<TmsaCoin>,
    secure: bool,
    req: api::Login,
) -> Result<Response, Rejection> {
    let session = coin.login(req).await.map_err(reject)?;
    let cookie = session_cookie(session.token.to_string(), session.max_age, secure);

    let body = reply::json(&api::LoginReply {
        success: true,
        session,
    });
    Ok(reply::with_header(body, header::SET_COOKIE, cookie.to_string()).into_response())
}

async fn logout(
    coin: Arc<TmsaCoin>,
    secure: bool,
    body: api::TokenOnly,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let token = presented_token(body.token.as_deref(), cookie);
    match (&body.token, &token) {
        (Some(_), None) => debug!("logout with a malformed token"),
        _ => coin.logout(token.as_ref()).await.map_err(reject)?,
    }

    let mut cookie = session_cookie(String::new(), 0, secure);
    cookie.make_removal();
    Ok(reply::with_header(success(), header::SET_COOKIE, cookie.to_string()).into_response())
}

async fn own_balance(
    coin: Arc<TmsaCoin>,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let caller = coin.caller(cookie.as_ref()).await.map_err(reject)?;
    let balance = coin.balance(caller.user()).await.map_err(reject)?;
    Ok(reply::json(&balance).into_response())
}

async fn user_balance(username: String, coin: Arc<TmsaCoin>) -> Result<Response, Rejection> {
    let balance = coin.balance(Some(&username)).await.map_err(reject)?;
    Ok(reply::json(&balance).into_response())
}

async fn history(
    coin: Arc<TmsaCoin>,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let caller = coin.caller(cookie.as_ref()).await.map_err(reject)?;
    let history = coin.history(&caller).await.map_err(reject)?;
    Ok(reply::json(&history).into_response())
}

async fn check_session(
    coin: Arc<TmsaCoin>,
    body: api::TokenOnly,
    cookie: Option<SessionToken>,
) -> Result<Response, Rejection> {
    let token = presented_token(body.token.as_deref(), cookie);
    let check = coin.check_session(token.as_ref()).await.map_err(reject)?;
    Ok(reply::json(&check).into_response())
}

async fn recover(err: Rejection) -> Result<Response, Infallible> {
    let (status, reason) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<coin::Error>() {
        (StatusCode::from(e), e.reason().to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        debug!("bad request body: {e}");
        (StatusCode::BAD_REQUEST, "Request body is not valid JSON".to_string())
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::BAD_REQUEST, "Request body too large".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some()
        || err.find::<warp::reject::UnsupportedMediaType>().is_some()
    {
        (StatusCode::BAD_REQUEST, "Malformed request".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    };

    let body = reply::json(&api::Outcome::failed(reason));
    Ok(reply::with_status(body, status).into_response())
}

#[cfg(test)]
mod test {
    use serde_json::{json, Value};
    use warp::test::request;

    use super::*;
    use crate::backend::backend_file::Backend;

    async fn create_routes(
        dir: &tempfile::TempDir,
    ) -> (
        Arc<TmsaCoin>,
        impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone + 'static,
    ) {
        let store = Backend::new(dir.path()).await.unwrap();
        let coin = Arc::new(TmsaCoin::new(Arc::new(store), 60));
        (Arc::clone(&coin), routes(coin, false))
    }

    fn body(res: &warp::http::Response<Bytes>) -> Value {
        serde_json::from_slice(res.body()).unwrap()
    }

    fn session_cookie_of(res: &warp::http::Response<Bytes>) -> String {
        res.headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn register_login_and_pay() {
        let dir = tempfile::tempdir().unwrap();
        let (coin, api) = create_routes(&dir).await;

        for (username, password) in [("root", "root"), ("alice", "pw1"), ("bob", "pw2")] {
            let res = request()
                .method("POST")
                .path("/tmsacoin/api/new_account")
                .json(&json!({ "username": username, "password": password }))
                .reply(&api)
                .await;
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(body(&res), json!({ "success": true }));
        }
        coin.promote("root").await.unwrap();

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/login")
            .json(&json!({ "username": "root", "password": "root" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let root_token = body(&res)["session"]["token"].as_str().unwrap().to_string();
        assert_eq!(body(&res)["session"]["user"], json!({ "name": "root", "admin": true }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/mint")
            .json(&json!({ "recipient": "alice", "amount": 100, "token": root_token }))
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "success": true }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/login")
            .json(&json!({ "username": "alice", "password": "pw1" }))
            .reply(&api)
            .await;
        let set_cookie = session_cookie_of(&res);
        assert!(set_cookie.starts_with("tmsacoin-session="));
        assert!(set_cookie.contains("SameSite=Strict"));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert!(set_cookie.contains("Max-Age=60"));
        assert!(!set_cookie.contains("Secure"));
        let alice_cookie = set_cookie.split(';').next().unwrap().to_string();

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/transfer")
            .header("cookie", &alice_cookie)
            .json(&json!({ "to": "bob", "amount": 40 }))
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "success": true }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/transfer")
            .header("cookie", &alice_cookie)
            .json(&json!({ "to": "bob", "amount": 100 }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body(&res),
            json!({ "success": false, "error": "Insufficient balance" })
        );

        let res = request()
            .path("/tmsacoin/api/balance")
            .header("cookie", &alice_cookie)
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "balance": 60 }));

        let res = request()
            .path("/tmsacoin/api/balance/bob")
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "balance": 40 }));

        let res = request()
            .path("/tmsacoin/api/history")
            .header("cookie", &alice_cookie)
            .reply(&api)
            .await;
        assert_eq!(
            body(&res),
            json!({ "transactions": [
                { "id": 1, "recipient": "alice", "amount": 100 },
                { "id": 2, "sender": "alice", "recipient": "bob", "amount": 40 },
            ]})
        );
    }

    #[tokio::test]
    async fn unauthorized_callers() {
        let dir = tempfile::tempdir().unwrap();
        let (_coin, api) = create_routes(&dir).await;

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/mint")
            .json(&json!({ "recipient": "alice", "amount": 100 }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body(&res)["success"], json!(false));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/transfer")
            .json(&json!({ "to": "bob", "amount": 1, "token": "deadbeef" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/login")
            .json(&json!({ "username": "nobody", "password": "x" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert!(res.headers().get(header::SET_COOKIE).is_none());

        let res = request()
            .path("/tmsacoin/api/history")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn sessions_via_body_and_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let (_coin, api) = create_routes(&dir).await;

        request()
            .method("POST")
            .path("/tmsacoin/api/new_account")
            .json(&json!({ "username": "alice", "password": "pw1" }))
            .reply(&api)
            .await;

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/login")
            .json(&json!({ "username": "alice", "password": "pw1" }))
            .reply(&api)
            .await;
        let token = body(&res)["session"]["token"].as_str().unwrap().to_string();

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/check_session")
            .json(&json!({ "token": token }))
            .reply(&api)
            .await;
        assert_eq!(
            body(&res),
            json!({ "valid": true, "user": "alice", "admin": false })
        );

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/logout")
            .header("cookie", format!("{SESSION_COOKIE}={token}"))
            .header("content-length", "0")
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "success": true }));
        assert!(session_cookie_of(&res).contains("Max-Age=0"));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/check_session")
            .json(&json!({ "token": token }))
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "valid": false }));
    }

    #[tokio::test]
    async fn malformed_body_tokens_are_invalid_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (coin, api) = create_routes(&dir).await;

        coin.new_account(
            &crate::gate::Caller::anonymous(),
            api::NewAccount {
                username: "alice".into(),
                password: "pw1".into(),
                admin: false,
                token: None,
            },
        )
        .await
        .unwrap();
        let session = coin
            .login(api::Login {
                username: "alice".into(),
                password: "pw1".into(),
            })
            .await
            .unwrap();
        let alice_cookie = format!("{SESSION_COOKIE}={}", session.token);

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/check_session")
            .json(&json!({ "token": "not-a-token" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res), json!({ "valid": false }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/transfer")
            .json(&json!({ "to": "bob", "amount": 1, "token": "dead-beef" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // the body's token still wins over a good cookie
        let res = request()
            .method("POST")
            .path("/tmsacoin/api/check_session")
            .header("cookie", &alice_cookie)
            .json(&json!({ "token": "dead-beef" }))
            .reply(&api)
            .await;
        assert_eq!(body(&res), json!({ "valid": false }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/logout")
            .json(&json!({ "token": "" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res), json!({ "success": true }));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/check_session")
            .header("cookie", &alice_cookie)
            .header("content-length", "0")
            .reply(&api)
            .await;
        assert_eq!(
            body(&res),
            json!({ "valid": true, "user": "alice", "admin": false })
        );
    }

    #[tokio::test]
    async fn malformed_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (_coin, api) = create_routes(&dir).await;

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/new_account")
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/new_account")
            .json(&json!({ "username": "../etc", "password": "pw" }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body(&res)["success"], json!(false));

        let res = request()
            .method("POST")
            .path("/tmsacoin/api/transfer")
            .json(&json!({ "to": "bob", "amount": 2.5 }))
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = request()
            .path("/tmsacoin/api/nowhere")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = request()
            .method("GET")
            .path("/tmsacoin/api/transfer")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

        let res = request()
            .path("/tmsacoin/api/balance/nobody")
            .reply(&api)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body(&res), json!({ "balance": 0 }));
    }
}
