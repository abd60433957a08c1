use tokio::sync::watch;

use super::session::SessionSnapshot;

/// Route protected views redirect to when no session is held
pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Redirect(String),
}

/// Admission check for protected views.
///
/// Reads session snapshots only; never touches the network or storage.
#[derive(Clone)]
pub struct AuthGate {
    session: watch::Receiver<SessionSnapshot>,
    login_route: String,
}

impl AuthGate {
    pub fn new(session: watch::Receiver<SessionSnapshot>) -> Self {
        Self {
            session,
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
        }
    }

    pub fn with_login_route(mut self, route: impl Into<String>) -> Self {
        self.login_route = route.into();
        self
    }

    /// True while the session holds a non-empty access token
    pub fn is_allowed(&self) -> bool {
        self.session.borrow().is_authenticated()
    }

    pub fn decision(&self) -> GateDecision {
        if self.is_allowed() {
            GateDecision::Allow
        } else {
            GateDecision::Redirect(self.login_route.clone())
        }
    }

    /// Wait until the startup restore has finished
    pub async fn ready(&mut self) {
        // A dropped manager can never finish restoring; fall through and deny
        let _ = self.session.wait_for(|s| s.restored).await;
    }

    /// Decide admission once the session is known
    pub async fn admit(&mut self) -> GateDecision {
        self.ready().await;
        self.decision()
    }

    /// Wait for the next session change and re-evaluate.
    /// `None` once the session manager is gone.
    pub async fn changed(&mut self) -> Option<GateDecision> {
        self.session.changed().await.ok()?;
        Some(self.decision())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::SessionPhase;
    use crate::auth::CredentialPair;

    fn signed_in() -> SessionSnapshot {
        SessionSnapshot {
            phase: SessionPhase::Authenticated,
            pair: Some(CredentialPair::new("access", "refresh")),
            restored: true,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn test_decision_follows_access_token() {
        let (tx, rx) = watch::channel(SessionSnapshot::default());
        let gate = AuthGate::new(rx);
        assert!(!gate.is_allowed());
        assert_eq!(gate.decision(), GateDecision::Redirect("/login".to_string()));

        tx.send_replace(signed_in());
        assert!(gate.is_allowed());
        assert_eq!(gate.decision(), GateDecision::Allow);

        // An empty access token does not count
        tx.send_replace(SessionSnapshot {
            pair: Some(CredentialPair::new("", "refresh")),
            ..signed_in()
        });
        assert!(!gate.is_allowed());
    }

    #[test]
    fn test_custom_login_route() {
        let (_tx, rx) = watch::channel(SessionSnapshot::default());
        let gate = AuthGate::new(rx).with_login_route("/signin");
        assert_eq!(gate.decision(), GateDecision::Redirect("/signin".to_string()));
    }

    #[tokio::test]
    async fn test_admit_waits_for_restore() {
        let (tx, rx) = watch::channel(SessionSnapshot {
            phase: SessionPhase::Restoring,
            ..SessionSnapshot::default()
        });
        let mut gate = AuthGate::new(rx);

        let admitted = tokio::spawn(async move { gate.admit().await });
        tokio::task::yield_now().await;
        assert!(!admitted.is_finished());

        tx.send_replace(signed_in());
        assert_eq!(admitted.await.expect("join"), GateDecision::Allow);
    }

    #[tokio::test]
    async fn test_changed_reports_logout() {
        let (tx, rx) = watch::channel(signed_in());
        let mut gate = AuthGate::new(rx);

        tx.send_replace(SessionSnapshot {
            restored: true,
            ..SessionSnapshot::default()
        });
        assert_eq!(
            gate.changed().await,
            Some(GateDecision::Redirect("/login".to_string()))
        );

        drop(tx);
        assert_eq!(gate.changed().await, None);
    }
}
