use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CREATE_TIMEOUT: Duration = Duration::from_secs(180);
const CREATE_TIMEOUT_RETRY: Duration = Duration::from_secs(30);
const SESSION_TTL: Duration = Duration::from_secs(5 * 60);
const TICK_INTERVAL: Duration = Duration::from_secs(1);
const DELETE_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_USER_AGENT: &str = "headless-proxy";

/// What the coordinator hands back for a session request.
///
/// `Token` is an existing live session. `Create` carries the sender end of a
/// single-use handoff channel: the requester dispatches upstream with the
/// session header set to `"create"` and either sends the token the upstream
/// returned or drops the sender to signal failure.
pub enum SessionGrant {
    Token(String),
    Create(oneshot::Sender<String>),
}

struct SessionRequest {
    retry: bool,
    reply: oneshot::Sender<SessionGrant>,
}

/// Handle to one client's session coordinator.
///
/// The coordinator task exclusively owns the mutable session state; this
/// handle only reaches it through message passing, so concurrent requests
/// for the same client serialize on state transitions without any locks.
#[derive(Clone)]
pub struct SessionManager {
    request_tx: mpsc::UnboundedSender<SessionRequest>,
    broken_tx: mpsc::UnboundedSender<String>,
}

/// Timeouts are parameters so tests can run the state machine on a short
/// clock; production uses [`SessionManager::spawn`].
#[derive(Clone, Copy)]
pub(crate) struct SessionTimeouts {
    pub create: Duration,
    pub create_retry: Duration,
    pub ttl: Duration,
    pub tick: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            create: CREATE_TIMEOUT,
            create_retry: CREATE_TIMEOUT_RETRY,
            ttl: SESSION_TTL,
            tick: TICK_INTERVAL,
        }
    }
}

impl SessionManager {
    /// Spawn the coordinator and deleter tasks for one client.
    pub fn spawn(api_key: String, crawlera_addr: String) -> Self {
        Self::spawn_with(api_key, crawlera_addr, SessionTimeouts::default())
    }

    pub(crate) fn spawn_with(
        api_key: String,
        crawlera_addr: String,
        timeouts: SessionTimeouts,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (broken_tx, broken_rx) = mpsc::unbounded_channel();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_deleter(api_key, crawlera_addr, delete_rx));
        tokio::spawn(
            Coordinator {
                token: None,
                last_used: Instant::now(),
                request_rx,
                broken_rx,
                delete_tx,
                timeouts,
            }
            .run(),
        );

        Self {
            request_tx,
            broken_tx,
        }
    }

    /// Ask the coordinator for a session. Blocks until the coordinator
    /// serves the request; during an in-flight creation that means sharing
    /// in that one attempt's outcome — the token it produces, or `None`
    /// when it times out or fails.
    pub async fn acquire(&self, retry: bool) -> Option<SessionGrant> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(SessionRequest {
                retry,
                reply: reply_tx,
            })
            .ok()?;
        reply_rx.await.ok()
    }

    /// Report a dead session token.
    pub fn report_broken(&self, token: String) {
        let _ = self.broken_tx.send(token);
    }
}

struct Coordinator {
    token: Option<String>,
    last_used: Instant,
    request_rx: mpsc::UnboundedReceiver<SessionRequest>,
    broken_rx: mpsc::UnboundedReceiver<String>,
    delete_tx: mpsc::UnboundedSender<String>,
    timeouts: SessionTimeouts,
}

impl Coordinator {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.timeouts.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(request) => self.serve(request).await,
                    None => return,
                },
                broken = self.broken_rx.recv() => match broken {
                    Some(token) => self.handle_broken(token),
                    None => return,
                },
                _ = tick.tick() => self.expire_idle(),
            }
        }
    }

    async fn serve(&mut self, request: SessionRequest) {
        match self.token.clone() {
            Some(token) => {
                self.last_used = Instant::now();
                let _ = request.reply.send(SessionGrant::Token(token));
            }
            None => self.create_session(request).await,
        }
    }

    /// Idle → Creating: hand the requester a creation channel and wait for
    /// it to settle. Requests arriving meanwhile never start an attempt of
    /// their own: they are parked here and answered from this attempt's
    /// outcome — the token on success, no reply on timeout or failure — so
    /// at most one creation handoff is ever outstanding.
    async fn create_session(&mut self, request: SessionRequest) {
        let (handoff_tx, mut handoff_rx) = oneshot::channel();
        if request
            .reply
            .send(SessionGrant::Create(handoff_tx))
            .is_err()
        {
            // Requester is gone; its sender just dropped, so there is no
            // outstanding creation to wait for.
            return;
        }

        let timeout = if request.retry {
            self.timeouts.create_retry
        } else {
            self.timeouts.create
        };
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut waiters: Vec<oneshot::Sender<SessionGrant>> = Vec::new();

        loop {
            tokio::select! {
                outcome = &mut handoff_rx => {
                    if let Ok(token) = outcome {
                        self.token = Some(token.clone());
                        self.last_used = Instant::now();
                        for waiter in waiters.drain(..) {
                            let _ = waiter.send(SessionGrant::Token(token.clone()));
                        }
                    }
                    // On failure the waiters drop unanswered.
                    return;
                }
                request = self.request_rx.recv() => match request {
                    Some(request) => waiters.push(request.reply),
                    None => return,
                },
                broken = self.broken_rx.recv() => match broken {
                    // Any token reported while creating belongs to a
                    // previous session; schedule it for deletion.
                    Some(token) if !token.is_empty() => {
                        let _ = self.delete_tx.send(token);
                    }
                    Some(_) => {}
                    None => return,
                },
                _ = &mut deadline => {
                    debug!("timed out waiting for a new session");
                    return;
                }
            }
        }
    }

    fn handle_broken(&mut self, broken: String) {
        match self.token {
            Some(ref current) if *current == broken => {
                let _ = self.delete_tx.send(broken);
                self.token = None;
            }
            _ => {
                debug!(
                    current = ?self.token,
                    broken = %broken,
                    "unknown broken session has been reported"
                );
            }
        }
    }

    fn expire_idle(&mut self) {
        if let Some(ref token) = self.token {
            if self.last_used.elapsed() >= self.timeouts.ttl {
                info!(session_id = %token, "session expired after idle timeout");
                let _ = self.delete_tx.send(token.clone());
                self.token = None;
            }
        }
    }
}

/// Drains the delete queue, removing dead sessions from the upstream API.
/// Failures are logged and otherwise ignored.
async fn run_deleter(
    api_key: String,
    crawlera_addr: String,
    mut delete_rx: mpsc::UnboundedReceiver<String>,
) {
    let client = reqwest::Client::builder()
        .timeout(DELETE_TIMEOUT)
        .user_agent(DELETE_USER_AGENT)
        .build()
        .expect("reqwest client");

    while let Some(session_id) = delete_rx.recv().await {
        if session_id.is_empty() {
            continue;
        }

        match delete_session(&client, &api_key, &crawlera_addr, &session_id).await {
            Ok(()) => info!(session_id = %session_id, "session was deleted from the upstream"),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "cannot delete session from the upstream"
                );
            }
        }
    }
}

async fn delete_session(
    client: &reqwest::Client,
    api_key: &str,
    crawlera_addr: &str,
    session_id: &str,
) -> anyhow::Result<()> {
    let url = format!("http://{}/sessions/{}", crawlera_addr, session_id);
    let response = client
        .delete(&url)
        .basic_auth(api_key, Some(""))
        .send()
        .await?;

    let status = response.status();
    // Drain and discard the body so the connection can be reused.
    let _ = response.bytes().await;

    if status.as_u16() >= 400 {
        anyhow::bail!("response status code is {}", status.as_u16());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            create: Duration::from_millis(200),
            create_retry: Duration::from_millis(100),
            ttl: Duration::from_millis(150),
            tick: Duration::from_millis(20),
        }
    }

    fn manager() -> SessionManager {
        SessionManager::spawn_with(
            "apikey".to_string(),
            "127.0.0.1:1".to_string(),
            test_timeouts(),
        )
    }

    #[tokio::test]
    async fn test_first_request_gets_creation_handoff() {
        let mgr = manager();

        match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => {
                handoff.send("s1".to_string()).unwrap();
            }
            _ => panic!("expected a creation handoff"),
        }

        match mgr.acquire(false).await {
            Some(SessionGrant::Token(token)) => assert_eq!(token, "s1"),
            _ => panic!("expected the created token"),
        }
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_idle() {
        let mgr = manager();

        match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => drop(handoff),
            _ => panic!("expected a creation handoff"),
        }

        // The next request becomes the new creator.
        assert!(matches!(
            mgr.acquire(false).await,
            Some(SessionGrant::Create(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_creation() {
        let mgr = manager();

        let handoff = match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff,
            _ => panic!("expected a creation handoff"),
        };

        // A second request while creating: it must not receive another
        // handoff, only the settled token.
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.acquire(false).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handoff.send("s1".to_string()).unwrap();

        match waiter.await.unwrap() {
            Some(SessionGrant::Token(token)) => assert_eq!(token, "s1"),
            _ => panic!("expected the shared token"),
        }
    }

    #[tokio::test]
    async fn test_waiters_get_no_reply_when_creation_fails() {
        let mgr = manager();

        let handoff = match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff,
            _ => panic!("expected a creation handoff"),
        };

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.acquire(false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The creation fails: the parked request must not start a second
        // attempt, it simply gets no reply.
        drop(handoff);
        assert!(waiter.await.unwrap().is_none());

        // The coordinator is idle again; a later request becomes the next
        // creator.
        assert!(matches!(
            mgr.acquire(false).await,
            Some(SessionGrant::Create(_))
        ));
    }

    #[tokio::test]
    async fn test_waiters_share_creation_timeout() {
        let mgr = manager();

        let handoff = match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff,
            _ => panic!("expected a creation handoff"),
        };

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.acquire(false).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing resolves the handoff; the coordinator gives up after the
        // creation timeout and the parked request shares that outcome.
        assert!(waiter.await.unwrap().is_none());
        drop(handoff);
    }

    #[tokio::test]
    async fn test_broken_session_clears_token() {
        let mgr = manager();

        match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff.send("s1".to_string()).unwrap(),
            _ => panic!("expected a creation handoff"),
        }
        match mgr.acquire(false).await {
            Some(SessionGrant::Token(token)) => assert_eq!(token, "s1"),
            _ => panic!("expected a token"),
        }

        mgr.report_broken("s1".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Idle again: the next request starts a fresh creation.
        match mgr.acquire(true).await {
            Some(SessionGrant::Create(handoff)) => handoff.send("s2".to_string()).unwrap(),
            _ => panic!("expected a creation handoff after break"),
        }
        match mgr.acquire(false).await {
            Some(SessionGrant::Token(token)) => assert_eq!(token, "s2"),
            _ => panic!("expected the replacement token"),
        }
    }

    #[tokio::test]
    async fn test_unknown_broken_session_ignored() {
        let mgr = manager();

        match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff.send("s1".to_string()).unwrap(),
            _ => panic!("expected a creation handoff"),
        }

        mgr.report_broken("other".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;

        match mgr.acquire(false).await {
            Some(SessionGrant::Token(token)) => assert_eq!(token, "s1"),
            _ => panic!("token should survive an unknown broken report"),
        }
    }

    #[tokio::test]
    async fn test_idle_session_expires() {
        let mgr = manager();

        match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff.send("s1".to_string()).unwrap(),
            _ => panic!("expected a creation handoff"),
        }

        // Past the TTL the coordinator must discard the token and start a
        // fresh creation on the next request.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            mgr.acquire(false).await,
            Some(SessionGrant::Create(_))
        ));
    }

    #[tokio::test]
    async fn test_creation_timeout_recovers() {
        let mgr = manager();

        let handoff = match mgr.acquire(false).await {
            Some(SessionGrant::Create(handoff)) => handoff,
            _ => panic!("expected a creation handoff"),
        };

        // Keep the handoff alive but never resolve it; the coordinator must
        // give up on its own after the creation timeout.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            mgr.acquire(false).await,
            Some(SessionGrant::Create(_))
        ));
        drop(handoff);
    }
}
