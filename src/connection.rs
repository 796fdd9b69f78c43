//! One live agent connection and its transaction discipline.
//!
//! The agent protocol has no request identifiers: responses match requests
//! purely by arrival order. The engine therefore admits a single
//! transaction at a time; a submission that overlaps an in-flight one is
//! rejected immediately with [`AgentError::OperationInProgress`] and
//! nothing is written for it.
//!
//! All socket I/O happens on one spawned task that owns the framed stream.
//! State transitions return an [`Action`] which the task executes only
//! after the state has settled, so a slot resolution can never re-enter
//! the state machine.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::AgentCodec;
use crate::error::AgentError;
use crate::protocol::{Request, Response};

/// One-shot handoff carrying a transaction's outcome back to its caller.
pub type ResponseSlot = oneshot::Sender<Result<Response, AgentError>>;

/// A request paired with the slot its outcome is delivered through.
///
/// The slot is resolved exactly once: with the agent's response, or with
/// the error that ended the transaction.
#[derive(Debug)]
pub struct Transaction {
    pub request: Request,
    pub slot: ResponseSlot,
}

/// Cloneable submission handle for one agent connection.
#[derive(Debug, Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Transaction>,
}

impl Connection {
    /// Take ownership of a connected stream and spawn its I/O task.
    pub fn open(stream: UnixStream) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(stream, receiver));
        Connection { commands }
    }

    /// Hand a transaction to the connection task.
    ///
    /// Never fails: if the connection is already gone the transaction's
    /// slot is resolved with the inactive error right here.
    pub fn submit(&self, transaction: Transaction) {
        if let Err(mpsc::error::SendError(transaction)) = self.commands.send(transaction) {
            let _ = transaction.slot.send(Err(AgentError::channel_inactive()));
        }
    }

    /// Submit a request and wait for its outcome.
    pub async fn transact(&self, request: Request) -> Result<Response, AgentError> {
        let (slot, response) = oneshot::channel();
        self.submit(Transaction { request, slot });
        response
            .await
            .unwrap_or_else(|_| Err(AgentError::channel_inactive()))
    }
}

/// What the I/O task must do after a transition.
#[derive(Debug)]
enum Action {
    /// Write this request to the agent.
    Send(Request),
    /// Resolve this slot with this outcome.
    Resolve(ResponseSlot, Result<Response, AgentError>),
    /// Nothing to do.
    None,
}

enum State {
    Idle,
    Pending(ResponseSlot),
}

/// The single-in-flight transaction state machine, free of any I/O.
struct Channel {
    state: State,
}

impl Channel {
    fn new() -> Self {
        Channel { state: State::Idle }
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    fn submit(&mut self, transaction: Transaction) -> Action {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => {
                self.state = State::Pending(transaction.slot);
                Action::Send(transaction.request)
            }
            State::Pending(in_flight) => {
                self.state = State::Pending(in_flight);
                Action::Resolve(transaction.slot, Err(AgentError::OperationInProgress))
            }
        }
    }

    fn on_response(&mut self, outcome: Result<Response, AgentError>) -> Action {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Pending(slot) => Action::Resolve(slot, outcome),
            State::Idle => Action::None,
        }
    }

    fn on_inactive(&mut self) -> Action {
        self.on_response(Err(AgentError::channel_inactive()))
    }
}

async fn run(stream: UnixStream, mut commands: mpsc::UnboundedReceiver<Transaction>) {
    let mut framed = Framed::new(stream, AgentCodec::default());
    let mut channel = Channel::new();
    let mut handles_gone = false;

    loop {
        tokio::select! {
            command = commands.recv(), if !handles_gone => match command {
                Some(transaction) => {
                    let action = channel.submit(transaction);
                    if !perform(&mut framed, &mut channel, action).await {
                        break;
                    }
                }
                None => {
                    // No handle can submit anymore. An in-flight response
                    // is still owed to its slot, so only stop once idle.
                    handles_gone = true;
                    if channel.is_idle() {
                        break;
                    }
                }
            },
            frame = framed.next() => match frame {
                Some(Ok(response)) => {
                    debug!(?response, "response received");
                    match channel.on_response(Ok(response)) {
                        Action::None => warn!("agent sent a response with no request in flight"),
                        action => {
                            perform(&mut framed, &mut channel, action).await;
                        }
                    }
                    if handles_gone && channel.is_idle() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    // A malformed response poisons the transaction and the
                    // connection both.
                    warn!(error = %err, "failed to decode agent response");
                    let action = channel.on_response(Err(err));
                    perform(&mut framed, &mut channel, action).await;
                    break;
                }
                None => {
                    let action = channel.on_inactive();
                    perform(&mut framed, &mut channel, action).await;
                    break;
                }
            },
        }
    }

    // Anything still queued behind the dead connection gets the same
    // terminal error, so every admitted slot resolves.
    commands.close();
    while let Ok(transaction) = commands.try_recv() {
        let _ = transaction.slot.send(Err(AgentError::channel_inactive()));
    }
}

/// Execute one action. Returns `false` when the connection is unusable.
async fn perform(
    framed: &mut Framed<UnixStream, AgentCodec>,
    channel: &mut Channel,
    action: Action,
) -> bool {
    match action {
        Action::Send(request) => {
            if let Err(err) = framed.send(request).await {
                warn!(error = %err, "failed to write request to agent");
                if let Action::Resolve(slot, outcome) = channel.on_inactive() {
                    let _ = slot.send(outcome);
                }
                return false;
            }
            true
        }
        Action::Resolve(slot, outcome) => {
            let _ = slot.send(outcome);
            true
        }
        Action::None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{write_string, write_u32};
    use crate::protocol::msg;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn slot_pair() -> (ResponseSlot, oneshot::Receiver<Result<Response, AgentError>>) {
        oneshot::channel()
    }

    #[test]
    fn submit_while_idle_sends() {
        let mut channel = Channel::new();
        let (slot, _response) = slot_pair();
        let action = channel.submit(Transaction {
            request: Request::RequestIdentities,
            slot,
        });
        assert!(matches!(action, Action::Send(Request::RequestIdentities)));
        assert!(!channel.is_idle());
    }

    #[test]
    fn overlapping_submit_is_rejected() {
        let mut channel = Channel::new();
        let (first, mut first_rx) = slot_pair();
        let (second, mut second_rx) = slot_pair();

        channel.submit(Transaction {
            request: Request::RequestIdentities,
            slot: first,
        });
        let action = channel.submit(Transaction {
            request: Request::RequestIdentities,
            slot: second,
        });

        match action {
            Action::Resolve(slot, outcome) => {
                assert_eq!(outcome, Err(AgentError::OperationInProgress));
                let _ = slot.send(outcome);
            }
            other => panic!("expected a rejection, got {other:?}"),
        }
        assert_eq!(
            second_rx.try_recv().unwrap(),
            Err(AgentError::OperationInProgress)
        );
        // The in-flight transaction is untouched.
        assert!(first_rx.try_recv().is_err());
        assert!(!channel.is_idle());
    }

    #[test]
    fn response_resolves_the_pending_slot() {
        let mut channel = Channel::new();
        let (slot, mut response_rx) = slot_pair();
        channel.submit(Transaction {
            request: Request::RequestIdentities,
            slot,
        });

        match channel.on_response(Ok(Response::Success)) {
            Action::Resolve(slot, outcome) => {
                let _ = slot.send(outcome);
            }
            other => panic!("expected a resolution, got {other:?}"),
        }
        assert_eq!(response_rx.try_recv().unwrap(), Ok(Response::Success));
        assert!(channel.is_idle());
    }

    #[test]
    fn response_while_idle_is_dropped() {
        let mut channel = Channel::new();
        assert!(matches!(
            channel.on_response(Ok(Response::Success)),
            Action::None
        ));
        assert!(channel.is_idle());
    }

    #[test]
    fn transport_loss_fails_the_pending_slot() {
        let mut channel = Channel::new();
        let (slot, mut response_rx) = slot_pair();
        channel.submit(Transaction {
            request: Request::RequestIdentities,
            slot,
        });

        match channel.on_inactive() {
            Action::Resolve(slot, outcome) => {
                let _ = slot.send(outcome);
            }
            other => panic!("expected a resolution, got {other:?}"),
        }
        assert_eq!(
            response_rx.try_recv().unwrap(),
            Err(AgentError::channel_inactive())
        );

        // Idle afterwards, and a second loss is a no-op.
        assert!(matches!(channel.on_inactive(), Action::None));
    }

    async fn read_frame(stream: &mut UnixStream) -> Vec<u8> {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await.unwrap();
        frame
    }

    async fn write_frame(stream: &mut UnixStream, payload: &[u8]) {
        let mut out = Vec::new();
        write_u32(&mut out, payload.len() as u32);
        out.extend_from_slice(payload);
        stream.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn transact_round_trips_over_a_socket() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let connection = Connection::open(ours);

        let agent = tokio::spawn(async move {
            let frame = read_frame(&mut theirs).await;
            assert_eq!(frame, vec![msg::REQUEST_IDENTITIES]);

            let mut payload = vec![msg::IDENTITIES_ANSWER];
            write_u32(&mut payload, 1);
            write_string(&mut payload, b"publickey");
            write_string(&mut payload, b"comment");
            write_frame(&mut theirs, &payload).await;
            theirs
        });

        let response = connection.transact(Request::RequestIdentities).await.unwrap();
        match response {
            Response::IdentitiesAnswer(identities) => {
                assert_eq!(identities.len(), 1);
                assert_eq!(identities[0].key_blob, b"publickey");
                assert_eq!(identities[0].comment, "comment");
            }
            other => panic!("unexpected response {other:?}"),
        }
        drop(agent.await.unwrap());
    }

    #[tokio::test]
    async fn second_transaction_is_rejected_and_nothing_extra_is_sent() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let connection = Connection::open(ours);

        let (first_slot, first_rx) = slot_pair();
        let (second_slot, second_rx) = slot_pair();
        connection.submit(Transaction {
            request: Request::RequestIdentities,
            slot: first_slot,
        });
        connection.submit(Transaction {
            request: Request::RequestIdentities,
            slot: second_slot,
        });

        // The overlapping submission resolves without agent involvement.
        assert_eq!(
            second_rx.await.unwrap(),
            Err(AgentError::OperationInProgress)
        );

        let frame = read_frame(&mut theirs).await;
        assert_eq!(frame, vec![msg::REQUEST_IDENTITIES]);
        let mut payload = vec![msg::IDENTITIES_ANSWER];
        write_u32(&mut payload, 0);
        write_frame(&mut theirs, &payload).await;

        assert_eq!(
            first_rx.await.unwrap(),
            Ok(Response::IdentitiesAnswer(vec![]))
        );

        // Exactly one request went over the wire.
        theirs.shutdown().await.unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(std::time::Duration::from_millis(200), async {
            let _ = theirs.read_to_end(&mut rest).await;
        })
        .await
        .ok();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn peer_hangup_fails_the_pending_transaction() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let connection = Connection::open(ours);

        let pending = tokio::spawn({
            let connection = connection.clone();
            async move { connection.transact(Request::RequestIdentities).await }
        });

        // Swallow the request, then drop the socket without answering.
        let _ = read_frame(&mut theirs).await;
        drop(theirs);

        assert_eq!(pending.await.unwrap(), Err(AgentError::channel_inactive()));

        // Later submissions observe the dead connection too.
        assert_eq!(
            connection.transact(Request::RequestIdentities).await,
            Err(AgentError::channel_inactive())
        );
    }

    #[tokio::test]
    async fn malformed_response_surfaces_to_the_caller() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let connection = Connection::open(ours);

        let pending = tokio::spawn({
            let connection = connection.clone();
            async move { connection.transact(Request::RequestIdentities).await }
        });

        let _ = read_frame(&mut theirs).await;
        // SUCCESS with a stray byte inside the frame.
        write_frame(&mut theirs, &[msg::SUCCESS, 0]).await;

        assert_eq!(pending.await.unwrap(), Err(AgentError::TrailingBytes(1)));
    }
}
