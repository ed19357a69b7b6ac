// ClientRegistry - tracks client sockets per conversation and fans messages out

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ClientOutbound;

/// Sending side of one client socket.
///
/// The socket's writer task owns the receiver; once it exits the handle
/// reports closed and broadcasts skip it.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn deliver(&self, frame: &str) -> bool {
        self.tx.send(frame.to_string()).is_ok()
    }
}

/// Outcome of removing a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    pub conversation_id: String,
    pub conversation_empty: bool,
    pub registry_empty: bool,
}

#[derive(Default)]
struct RegistryState {
    /// Conversations in the order their set was created
    conversations: Vec<(String, Vec<ClientHandle>)>,
    /// Client id to owning conversation
    owners: HashMap<Uuid, String>,
}

impl RegistryState {
    fn is_empty(&self) -> bool {
        self.conversations.iter().all(|(_, clients)| clients.is_empty())
    }

    fn remove(&mut self, client_id: Uuid) -> Option<Unregistered> {
        let conversation_id = self.owners.remove(&client_id)?;
        let index = self
            .conversations
            .iter()
            .position(|(id, _)| *id == conversation_id)?;

        let clients = &mut self.conversations[index].1;
        clients.retain(|c| c.id != client_id);
        let conversation_empty = clients.is_empty();
        if conversation_empty {
            self.conversations.remove(index);
        }

        Some(Unregistered {
            conversation_id,
            conversation_empty,
            registry_empty: self.is_empty(),
        })
    }
}

/// Registry of live client connections keyed by conversation id
#[derive(Default)]
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client to a conversation's set
    ///
    /// A client already registered elsewhere is moved.
    ///
    /// # Returns
    /// `true` if the registry was globally empty before this call
    pub fn register(&self, client: ClientHandle, conversation_id: &str) -> bool {
        let mut state = self.state.lock();
        let first = state.is_empty();
        state.remove(client.id);

        state.owners.insert(client.id, conversation_id.to_string());
        match state
            .conversations
            .iter()
            .position(|(id, _)| id == conversation_id)
        {
            Some(index) => state.conversations[index].1.push(client),
            None => state
                .conversations
                .push((conversation_id.to_string(), vec![client])),
        }

        first
    }

    /// Removes a client from whatever conversation holds it
    ///
    /// Returns `None` for unknown clients.
    pub fn unregister(&self, client_id: Uuid) -> Option<Unregistered> {
        self.state.lock().remove(client_id)
    }

    /// Sends to every open client of one conversation
    ///
    /// # Returns
    /// Number of clients the frame was handed to
    pub fn broadcast(&self, conversation_id: &str, message: &ClientOutbound) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .filter(|(id, _)| id == conversation_id)
            .flat_map(|(_, clients)| clients.iter())
            .filter(|c| !c.is_closed() && c.deliver(&frame))
            .count()
    }

    /// Sends to every open client in every conversation
    pub fn broadcast_all(&self, message: &ClientOutbound) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .flat_map(|(_, clients)| clients.iter())
            .filter(|c| !c.is_closed() && c.deliver(&frame))
            .count()
    }

    /// Sends to a single client; false if it is unknown or closed
    pub fn send_to(&self, client_id: Uuid, message: &ClientOutbound) -> bool {
        let Some(frame) = encode(message) else {
            return false;
        };
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .flat_map(|(_, clients)| clients.iter())
            .find(|c| c.id == client_id)
            .map(|c| !c.is_closed() && c.deliver(&frame))
            .unwrap_or(false)
    }

    /// Earliest-registered conversation that still has clients.
    ///
    /// Upstream events carry no conversation id, so every completed
    /// transcript is attributed to this one.
    pub fn pick_routing_target(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .find(|(_, clients)| !clients.is_empty())
            .map(|(id, _)| id.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().owners.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }
}

fn encode(message: &ClientOutbound) -> Option<String> {
    match message.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::error!("ClientRegistry: Failed to encode outbound frame: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn client() -> (ClientHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientHandle::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_first_registration_is_reported_once() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client();
        let (b, _rx_b) = client();

        assert!(registry.register(a, "c1"));
        assert!(!registry.register(b, "c2"));
    }

    #[test]
    fn test_unregister_reports_emptiness() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client();
        let (b, _rx_b) = client();
        let (a_id, b_id) = (a.id, b.id);
        registry.register(a, "c1");
        registry.register(b, "c1");

        let first = registry.unregister(a_id).unwrap();
        assert_eq!(first.conversation_id, "c1");
        assert!(!first.conversation_empty);
        assert!(!first.registry_empty);

        let second = registry.unregister(b_id).unwrap();
        assert!(second.conversation_empty);
        assert!(second.registry_empty);
        assert!(registry.unregister(b_id).is_none());
    }

    #[test]
    fn test_broadcast_targets_one_conversation_and_skips_closed() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client();
        let (b, rx_b) = client();
        let (c, mut rx_c) = client();
        registry.register(a, "c1");
        registry.register(b, "c1");
        registry.register(c, "c2");
        drop(rx_b);

        let sent = registry.broadcast("c1", &ClientOutbound::error("x"));
        assert_eq!(sent, 1);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_c).is_empty());

        let sent_all = registry.broadcast_all(&ClientOutbound::error("y"));
        assert_eq!(sent_all, 2);
    }

    #[test]
    fn test_send_to_single_client() {
        let registry = ClientRegistry::new();
        let (a, mut rx_a) = client();
        let (b, mut rx_b) = client();
        let a_id = a.id;
        registry.register(a, "c1");
        registry.register(b, "c1");

        assert!(registry.send_to(a_id, &ClientOutbound::error("only you")));
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
        assert!(!registry.send_to(Uuid::new_v4(), &ClientOutbound::error("nobody")));
    }

    #[test]
    fn test_routing_target_is_earliest_registered() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client();
        let (b, _rx_b) = client();
        let a_id = a.id;
        assert_eq!(registry.pick_routing_target(), None);

        registry.register(a, "first");
        registry.register(b, "second");
        assert_eq!(registry.pick_routing_target().as_deref(), Some("first"));

        registry.unregister(a_id);
        assert_eq!(registry.pick_routing_target().as_deref(), Some("second"));
    }

    #[test]
    fn test_reregister_moves_client() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = client();
        registry.register(a.clone(), "c1");
        registry.register(a.clone(), "c2");

        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.conversation_count(), 1);
        assert_eq!(registry.pick_routing_target().as_deref(), Some("c2"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register { client: usize, conversation: usize },
        Unregister { client: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6, 0usize..3).prop_map(|(client, conversation)| Op::Register {
                client,
                conversation
            }),
            (0usize..6).prop_map(|client| Op::Unregister { client }),
        ]
    }

    /// The global-empty predicate holds exactly when no conversation has clients.
    #[test]
    fn property_global_empty_matches_model() {
        proptest!(|(ops in prop::collection::vec(op(), 0..60))| {
            let registry = ClientRegistry::new();
            let handles: Vec<_> = (0..6).map(|_| client()).collect();
            let mut model: HashMap<usize, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Register { client, conversation } => {
                        let was_empty = model.is_empty();
                        let first = registry
                            .register(handles[client].0.clone(), &format!("c{}", conversation));
                        model.insert(client, conversation);
                        prop_assert_eq!(first, was_empty);
                    }
                    Op::Unregister { client } => {
                        let outcome = registry.unregister(handles[client].0.id);
                        let known = model.remove(&client);
                        prop_assert_eq!(outcome.is_some(), known.is_some());
                        if let (Some(outcome), Some(conversation)) = (outcome, known) {
                            prop_assert_eq!(outcome.registry_empty, model.is_empty());
                            let still_there = model.values().any(|c| *c == conversation);
                            prop_assert_eq!(outcome.conversation_empty, !still_there);
                        }
                    }
                }
                prop_assert_eq!(registry.is_empty(), model.is_empty());
                prop_assert_eq!(registry.client_count(), model.len());
            }
        });
    }
}
