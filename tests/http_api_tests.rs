//! HTTP API tests: a server on an ephemeral port driven with reqwest.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use taskportal::config::PortalConfig;
use taskportal::identity::{AccountStatus, DirectoryError, MemoryUserDirectory, Role, UserDirectory, UserRecord};
use taskportal::server::{serve, AppState};
use taskportal::tasks::{MemoryTaskRepository, Task, TaskStatus};

struct Harness {
    base: String,
    client: reqwest::Client,
    dir: Arc<MemoryUserDirectory>,
}

/// Logged-in browser session: cookie header plus CSRF token.
struct Browser {
    cookie: String,
    csrf: String,
    login: Value,
}

fn task(id: &str, who: &str, status: TaskStatus) -> Task {
    Task {
        id: id.into(),
        task_description: format!("checklist item {}", id),
        name: who.into(),
        department: Some("Stores".into()),
        given_by: Some("carol".into()),
        planned_date: None,
        actual_date: None,
        status,
        proof_url: None,
        remarks: None,
    }
}

/// Directory with a fixed delay per lookup, like a remote backend under load.
struct SlowDirectory {
    inner: Arc<MemoryUserDirectory>,
    delay: Duration,
}

#[async_trait]
impl UserDirectory for SlowDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, DirectoryError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_user(username).await
    }
}

async fn start() -> Result<Harness> {
    start_with(PortalConfig { secure_cookies: false, ..Default::default() }, Duration::ZERO).await
}

async fn start_with(cfg: PortalConfig, lookup_delay: Duration) -> Result<Harness> {
    let dir = Arc::new(MemoryUserDirectory::from_records([
        UserRecord::new("bob", "bobpw", Role::User).with_access("dashboard,assign_task").with_department("Stores"),
        UserRecord::new("carol", "carolpw", Role::Admin).with_access(""),
        UserRecord::new("dave", "davepw", Role::User).with_status(AccountStatus::Inactive),
    ]));
    let repo = Arc::new(MemoryTaskRepository::from_tasks([
        task("1", "bob", TaskStatus::Pending),
        task("2", "bob", TaskStatus::Pending),
        task("3", "erin", TaskStatus::Pending),
    ]));
    let directory = Arc::new(SlowDirectory { inner: dir.clone(), delay: lookup_delay });
    let state = AppState::new(cfg, directory, repo);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Err(e) = serve(listener, state).await { eprintln!("server task error: {e:?}"); }
    });
    Ok(Harness { base: format!("http://127.0.0.1:{}", port), client: reqwest::Client::new(), dir })
}

impl Harness {
    fn url(&self, path: &str) -> String { format!("{}{}", self.base, path) }

    async fn login(&self, user: &str, pass: &str) -> Result<Browser> {
        let resp = self.client.post(self.url("/login"))
            .json(&json!({"username": user, "password": pass}))
            .send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("login failed: HTTP {}", resp.status()));
        }
        let cookie = resp.headers().get_all(reqwest::header::SET_COOKIE).iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|s| s.split_once(';').map(|(nv, _)| nv.trim().to_string()))
            .next()
            .ok_or_else(|| anyhow!("no session cookie"))?;
        let login: Value = resp.json().await?;
        let csrf = login["csrf"].as_str().unwrap_or_default().to_string();
        Ok(Browser { cookie, csrf, login })
    }

    async fn get(&self, b: Option<&Browser>, path: &str) -> Result<(u16, Value)> {
        let mut req = self.client.get(self.url(path));
        if let Some(b) = b { req = req.header("cookie", &b.cookie); }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await?))
    }

    async fn post(&self, b: &Browser, path: &str, body: Value, with_csrf: bool) -> Result<(u16, Value)> {
        let mut req = self.client.post(self.url(path)).header("cookie", &b.cookie).json(&body);
        if with_csrf { req = req.header("x-csrf-token", &b.csrf); }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json().await?))
    }

    async fn gate(&self, b: Option<&Browser>, path: &str) -> Result<Value> {
        let (status, body) = self.get(b, &format!("/gate?path={}", path)).await?;
        assert_eq!(status, 200, "gate for {} returned {}: {}", path, status, body);
        Ok(body["result"].clone())
    }
}

#[tokio::test]
async fn login_outcomes() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;
    assert_eq!(bob.login["landing"], "/dashboard/user");
    assert_eq!(bob.login["user_access"], "dashboard,assign_task");
    assert!(!bob.csrf.is_empty());
    assert!(bob.cookie.starts_with("portal_session="));

    let carol = h.login("carol", "carolpw").await?;
    assert_eq!(carol.login["landing"], "/dashboard/admin");
    assert_eq!(carol.login["user_access"], "all");

    let resp = h.client.post(h.url("/login")).json(&json!({"username": "bob", "password": "nope"})).send().await?;
    assert_eq!(resp.status().as_u16(), 401);
    let resp = h.client.post(h.url("/login")).json(&json!({"username": "dave", "password": "davepw"})).send().await?;
    assert_eq!(resp.status().as_u16(), 403);
    Ok(())
}

#[tokio::test]
async fn gate_verdicts_over_http() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;

    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "authorized");
    let denied = h.gate(Some(&bob), "/dashboard/license").await?;
    assert_eq!(denied["verdict"], "denied");
    assert_eq!(denied["permission"], "license");
    assert_eq!(denied["escape_to"], "/dashboard/user");
    assert!(denied["message"].as_str().unwrap_or_default().contains("license"));
    assert_eq!(h.gate(Some(&bob), "/dashboard/hr").await?["verdict"], "denied");

    let anon = h.gate(None, "/dashboard/user").await?;
    assert_eq!(anon["verdict"], "redirect_to_login");
    assert_eq!(anon["location"], "/login");

    let (status, _) = h.get(Some(&bob), "/gate?path=/nowhere").await?;
    assert_eq!(status, 404);

    let carol = h.login("carol", "carolpw").await?;
    for path in ["/dashboard/admin", "/dashboard/assign-task", "/dashboard/hr", "/dashboard/license"] {
        assert_eq!(h.gate(Some(&carol), path).await?["verdict"], "authorized", "admin denied {}", path);
    }
    let (_, state) = h.get(Some(&carol), "/gate/state").await?;
    assert_eq!(state["state"]["state"], "done");
    Ok(())
}

#[tokio::test]
async fn deactivation_and_outage() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;
    let bob_phone = h.login("bob", "bobpw").await?;

    h.dir.set_offline(true);
    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "denied");
    // the session survives an outage
    let (status, body) = h.get(Some(&bob), "/session").await?;
    assert_eq!(status, 200);
    assert_eq!(body["session"]["username"], "bob");
    h.dir.set_offline(false);

    h.dir.set_status("bob", AccountStatus::Inactive);
    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "redirect_to_login");
    let (status, _) = h.get(Some(&bob), "/session").await?;
    assert_eq!(status, 401);
    let (status, _) = h.get(Some(&bob), "/tasks").await?;
    assert_eq!(status, 401);
    // other sessions of a deactivated account end too
    let (status, _) = h.get(Some(&bob_phone), "/session").await?;
    assert_eq!(status, 401);
    Ok(())
}

#[tokio::test]
async fn logout_requires_csrf() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;
    let (status, _) = h.post(&bob, "/logout", json!({}), false).await?;
    assert_eq!(status, 403);
    let (status, _) = h.get(Some(&bob), "/session").await?;
    assert_eq!(status, 200);

    let (status, body) = h.post(&bob, "/logout", json!({}), true).await?;
    assert_eq!(status, 200);
    assert_eq!(body["location"], "/login");
    let (status, _) = h.get(Some(&bob), "/session").await?;
    assert_eq!(status, 401);
    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "redirect_to_login");
    Ok(())
}

#[tokio::test]
async fn task_submission_and_review() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;
    let carol = h.login("carol", "carolpw").await?;

    let (status, body) = h.get(Some(&bob), "/tasks").await?;
    assert_eq!(status, 200);
    assert_eq!(body["count"], 2);
    let (_, body) = h.get(Some(&carol), "/tasks").await?;
    assert_eq!(body["count"], 3);
    let (status, _) = h.get(Some(&bob), "/tasks?status=bogus").await?;
    assert_eq!(status, 400);

    let proof = json!({"proof_url": "https://files.example.test/shelf.jpg"});
    let (status, _) = h.post(&bob, "/tasks/1/submit", proof.clone(), false).await?;
    assert_eq!(status, 403);
    let (status, body) = h.post(&bob, "/tasks/1/submit", proof.clone(), true).await?;
    assert_eq!(status, 200);
    assert_eq!(body["task"]["status"], "submitted");
    let (status, _) = h.post(&bob, "/tasks/3/submit", proof, true).await?;
    assert_eq!(status, 403);

    // review is admin-only
    let (status, body) = h.get(Some(&bob), "/tasks/pending").await?;
    assert_eq!(status, 403);
    assert_eq!(body["result"]["verdict"], "denied");
    let (status, _) = h.post(&bob, "/tasks/1/approve", json!({}), true).await?;
    assert_eq!(status, 403);

    let (_, body) = h.get(Some(&carol), "/tasks/pending").await?;
    assert_eq!(body["count"], 1);
    let (status, body) = h.post(&carol, "/tasks/1/reject", json!({"remarks": "photo is blurry"}), true).await?;
    assert_eq!(status, 200);
    assert_eq!(body["task"]["status"], "rejected");
    assert_eq!(body["task"]["remarks"], "photo is blurry");
    let (status, _) = h.post(&carol, "/tasks/1/approve", json!({}), true).await?;
    assert_eq!(status, 409);
    Ok(())
}

#[tokio::test]
async fn task_assignment_needs_permission() -> Result<()> {
    let h = start().await?;
    let bob = h.login("bob", "bobpw").await?;
    let new = json!({"task_description": "Count pallets", "name": "erin", "department": "Stores"});
    let (status, body) = h.post(&bob, "/tasks", new.clone(), true).await?;
    assert_eq!(status, 201);
    assert_eq!(body["task"]["given_by"], "bob");
    assert_eq!(body["task"]["status"], "pending");

    h.dir.upsert(UserRecord::new("bob", "bobpw", Role::User).with_access("dashboard"));
    let (status, body) = h.post(&bob, "/tasks", new, true).await?;
    assert_eq!(status, 403);
    assert_eq!(body["result"]["permission"], "assign_task");
    Ok(())
}

#[tokio::test]
async fn parallel_api_calls_from_one_session_all_succeed() -> Result<()> {
    let h = start_with(PortalConfig { secure_cookies: false, ..Default::default() }, Duration::from_millis(150)).await?;
    let carol = h.login("carol", "carolpw").await?;
    assert_eq!(h.gate(Some(&carol), "/dashboard/admin").await?["verdict"], "authorized");

    let (list, pending, filtered) = tokio::join!(
        h.get(Some(&carol), "/tasks"),
        h.get(Some(&carol), "/tasks/pending"),
        h.get(Some(&carol), "/tasks?status=pending"),
    );
    assert_eq!(list?.0, 200);
    assert_eq!(pending?.0, 200);
    assert_eq!(filtered?.0, 200);

    // data calls leave the navigation gate state alone
    let bob = h.login("bob", "bobpw").await?;
    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "authorized");
    let (status, _) = h.get(Some(&bob), "/tasks/pending").await?;
    assert_eq!(status, 403);
    let (_, state) = h.get(Some(&bob), "/gate/state").await?;
    assert_eq!(state["state"]["state"], "done");
    assert_eq!(state["state"]["verdict"]["verdict"], "authorized");
    Ok(())
}

#[tokio::test]
async fn cached_decisions_end_with_logout_and_deactivation() -> Result<()> {
    let cfg = PortalConfig {
        secure_cookies: false,
        authz_cache_allow_ms: 60_000,
        authz_cache_deny_ms: 60_000,
        ..Default::default()
    };
    let h = start_with(cfg, Duration::ZERO).await?;
    let bob = h.login("bob", "bobpw").await?;
    assert_eq!(h.gate(Some(&bob), "/dashboard/license").await?["verdict"], "denied");

    // the denial is remembered for the deny ttl
    h.dir.upsert(UserRecord::new("bob", "bobpw", Role::User).with_access("dashboard,license"));
    assert_eq!(h.gate(Some(&bob), "/dashboard/license").await?["verdict"], "denied");

    // logout forgets it
    let (status, _) = h.post(&bob, "/logout", json!({}), true).await?;
    assert_eq!(status, 200);
    let bob = h.login("bob", "bobpw").await?;
    assert_eq!(h.gate(Some(&bob), "/dashboard/license").await?["verdict"], "authorized");

    // deactivation seen on another route drops the cached allow
    h.dir.set_status("bob", AccountStatus::Inactive);
    assert_eq!(h.gate(Some(&bob), "/dashboard/user").await?["verdict"], "redirect_to_login");
    h.dir.upsert(UserRecord::new("bob", "bobpw", Role::User).with_access("dashboard"));
    let bob = h.login("bob", "bobpw").await?;
    let v = h.gate(Some(&bob), "/dashboard/license").await?;
    assert_eq!(v["verdict"], "denied");
    assert_eq!(v["permission"], "license");
    Ok(())
}
