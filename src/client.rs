//! Shared agent client: one connection, many callers.
//!
//! Every caller goes through a cloneable [`AgentClient`] handle. The first
//! caller dials the socket; callers arriving during the dial park a
//! one-shot waiter and are all fulfilled (or all failed) when the dial
//! settles. A failed client stays failed: recovery means building a new
//! [`AgentClient`], reconnect policy belongs to whoever owns it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::Connection;
use crate::error::AgentError;
use crate::identity::Identity;
use crate::protocol::{AgentIdentity, Request, Response};

type ConnectionSlot = oneshot::Sender<Result<Connection, AgentError>>;

enum Lifecycle {
    NotConnected,
    Connecting(Vec<ConnectionSlot>),
    Connected {
        conn: Connection,
        /// Identity list from the first successful query, served to later
        /// callers without another round trip. Dies with the connection.
        identities: Option<Vec<AgentIdentity>>,
    },
    Failed(AgentError),
}

/// Handle to a shared agent connection.
#[derive(Clone)]
pub struct AgentClient {
    path: Arc<PathBuf>,
    state: Arc<Mutex<Lifecycle>>,
}

impl AgentClient {
    /// Client for the agent listening at `path`. Nothing is dialed until
    /// the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        AgentClient {
            path: Arc::new(path.into()),
            state: Arc::new(Mutex::new(Lifecycle::NotConnected)),
        }
    }

    /// Client for the agent named by `SSH_AUTH_SOCK`.
    pub fn from_env() -> Result<Self, AgentError> {
        let path = std::env::var_os("SSH_AUTH_SOCK")
            .ok_or_else(|| AgentError::not_available("SSH_AUTH_SOCK is not set"))?;
        Ok(AgentClient::new(PathBuf::from(path)))
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// The shared connection, dialing it if this is the first caller.
    pub async fn connection(&self) -> Result<Connection, AgentError> {
        let waiter = {
            let mut state = self.state.lock().expect("lifecycle lock poisoned");
            match &mut *state {
                Lifecycle::NotConnected => {
                    let (slot, waiter) = oneshot::channel();
                    *state = Lifecycle::Connecting(vec![slot]);
                    tokio::spawn(dial(self.clone()));
                    waiter
                }
                Lifecycle::Connecting(waiters) => {
                    let (slot, waiter) = oneshot::channel();
                    waiters.push(slot);
                    waiter
                }
                Lifecycle::Connected { conn, .. } => return Ok(conn.clone()),
                Lifecycle::Failed(err) => return Err(err.clone()),
            }
        };
        waiter
            .await
            .unwrap_or_else(|_| Err(AgentError::channel_inactive()))
    }

    /// All identities held by the agent.
    ///
    /// Served from the cache once a query has succeeded on this
    /// connection; the cache is discarded when the connection is lost.
    pub async fn request_identities(&self) -> Result<Vec<AgentIdentity>, AgentError> {
        {
            let state = self.state.lock().expect("lifecycle lock poisoned");
            if let Lifecycle::Connected {
                identities: Some(identities),
                ..
            } = &*state
            {
                return Ok(identities.clone());
            }
        }

        match self.transact(Request::RequestIdentities).await? {
            Response::IdentitiesAnswer(identities) => {
                let mut state = self.state.lock().expect("lifecycle lock poisoned");
                if let Lifecycle::Connected {
                    identities: cache, ..
                } = &mut *state
                {
                    *cache = Some(identities.clone());
                }
                Ok(identities)
            }
            Response::Failure => Err(AgentError::AgentFailure),
            other => Err(unexpected("identities request", &other)),
        }
    }

    /// Ask the agent to sign `data` with the key identified by `key_blob`.
    ///
    /// The returned blob is the agent's SSH-encoded signature, passed
    /// through uninterpreted.
    pub async fn sign(
        &self,
        key_blob: &[u8],
        data: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>, AgentError> {
        let request = Request::SignRequest {
            key_blob: key_blob.to_vec(),
            data: data.to_vec(),
            flags,
        };
        match self.transact(request).await? {
            Response::SignResponse(signature) => Ok(signature),
            Response::Failure => Err(AgentError::AgentFailure),
            other => Err(unexpected("sign request", &other)),
        }
    }

    /// Hand a parsed private key to the agent.
    pub async fn add_identity(&self, identity: &Identity) -> Result<(), AgentError> {
        match self.transact(Request::AddIdentity(identity.clone())).await? {
            Response::Success => Ok(()),
            Response::Failure => Err(AgentError::AgentFailure),
            other => Err(unexpected("add identity", &other)),
        }
    }

    /// Ask the agent to forget one key.
    pub async fn remove_identity(&self, key_blob: &[u8]) -> Result<(), AgentError> {
        let request = Request::RemoveIdentity {
            key_blob: key_blob.to_vec(),
        };
        match self.transact(request).await? {
            Response::Success => Ok(()),
            Response::Failure => Err(AgentError::AgentFailure),
            other => Err(unexpected("remove identity", &other)),
        }
    }

    /// Ask the agent to forget every key.
    pub async fn remove_all_identities(&self) -> Result<(), AgentError> {
        match self.transact(Request::RemoveAllIdentities).await? {
            Response::Success => Ok(()),
            Response::Failure => Err(AgentError::AgentFailure),
            other => Err(unexpected("remove all identities", &other)),
        }
    }

    async fn transact(&self, request: Request) -> Result<Response, AgentError> {
        let conn = self.connection().await?;
        let outcome = conn.transact(request).await;
        if let Err(err @ AgentError::AgentNotAvailable { .. }) = &outcome {
            self.fail(err.clone());
        }
        outcome
    }

    /// Mark the connection lost. Waiting is over for everyone: later
    /// callers observe the error immediately, and the identity cache is
    /// gone with the state it lived in.
    fn fail(&self, err: AgentError) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if !matches!(&*state, Lifecycle::Failed(_)) {
            *state = Lifecycle::Failed(err);
        }
    }
}

/// Dial the socket and settle every parked waiter, outside the lock.
async fn dial(client: AgentClient) {
    let result = match UnixStream::connect(client.path.as_ref()).await {
        Ok(stream) => {
            debug!(path = %client.path.display(), "connected to agent");
            Ok(Connection::open(stream))
        }
        Err(err) => Err(AgentError::not_available(format!(
            "cannot connect to {}: {err}",
            client.path.display()
        ))),
    };

    let waiters = {
        let mut state = client.state.lock().expect("lifecycle lock poisoned");
        let previous = std::mem::replace(
            &mut *state,
            match &result {
                Ok(conn) => Lifecycle::Connected {
                    conn: conn.clone(),
                    identities: None,
                },
                Err(err) => Lifecycle::Failed(err.clone()),
            },
        );
        match previous {
            Lifecycle::Connecting(waiters) => waiters,
            // Only the dial task moves the state out of Connecting.
            _ => Vec::new(),
        }
    };

    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

fn unexpected(operation: &str, response: &Response) -> AgentError {
    AgentError::BadResponse(format!("unexpected reply to {operation}: {response:?}"))
}
