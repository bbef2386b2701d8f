use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as blocking,
        Arc,
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{self, delay_for};

use super::{Client, ClientError, ProtocolViolation};
use crate::{
    codec::{recv_message, send_message, PayloadCodec},
    heartbeat::testutils::{flush, heartbeats},
    learner::Learner,
    message::{ClientId, ClientReport, Payload, Registration, Report, Selection},
    settings::{tests::settings, Settings},
    transport::{Listener, Session, TransportError},
};

#[derive(Debug, Error)]
#[error("{0}")]
struct TestError(&'static str);

#[derive(Clone)]
enum Training {
    Succeed(Report, Payload<String>),
    Fail,
    Panic,
}

/// Records what the client asks of it.
#[derive(Default, Clone)]
struct Calls {
    configure: Arc<AtomicUsize>,
    load_data: Arc<AtomicUsize>,
    train: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<Payload<String>>>>,
    selections: Arc<Mutex<Vec<Selection>>>,
}

struct TestLearner {
    calls: Calls,
    training: Training,
    training_time: Duration,
    /// Training blocks its thread until this opens.
    gate: Option<blocking::Receiver<()>>,
}

impl TestLearner {
    fn new(training: Training) -> (Self, Calls) {
        let calls = Calls::default();
        let learner = Self {
            calls: calls.clone(),
            training,
            training_time: Duration::from_millis(0),
            gate: None,
        };
        (learner, calls)
    }

    fn gated(training: Training) -> (Self, Calls, blocking::Sender<()>) {
        let (open, gate) = blocking::channel();
        let (mut learner, calls) = Self::new(training);
        learner.gate = Some(gate);
        (learner, calls, open)
    }
}

#[async_trait]
impl Learner for TestLearner {
    type Weights = String;
    type Error = TestError;

    async fn configure(&mut self) -> Result<(), Self::Error> {
        self.calls.configure.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_data(&mut self) -> Result<(), Self::Error> {
        self.calls.load_data.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_payload(&mut self, payload: Payload<String>) -> Result<(), Self::Error> {
        self.calls.payloads.lock().unwrap().push(payload);
        Ok(())
    }

    async fn train(&mut self) -> Result<(Report, Payload<String>), Self::Error> {
        self.calls.train.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.gate.as_ref() {
            gate.recv_timeout(Duration::from_secs(10))
                .map_err(|_| TestError("gate never opened"))?;
        }
        delay_for(self.training_time).await;
        match self.training.clone() {
            Training::Succeed(report, payload) => Ok((report, payload)),
            Training::Fail => Err(TestError("out of memory")),
            Training::Panic => panic!("training crashed"),
        }
    }

    fn process_selection(&mut self, selection: &Selection) {
        self.calls.selections.lock().unwrap().push(*selection);
    }
}

fn trained() -> Training {
    Training::Succeed(Report::new(50, 0.91), Payload::Single("update".into()))
}

/// A server on an ephemeral port, with client settings pointing to it.
async fn server(id: u32) -> (Listener, Settings) {
    let listener = Listener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, settings(id, port))
}

/// Accept the main session of client `id`.
async fn accept(listener: &mut Listener, id: u32) -> Session {
    let mut session = listener.accept().await.unwrap();
    let registration: Registration = recv_message(&mut session).await.unwrap().unwrap();
    assert_eq!(registration.id, ClientId::new(id));
    session
}

/// Receive the report and payload of a round.
async fn collect(session: &mut Session) -> (ClientReport, Payload<String>) {
    let report: ClientReport = recv_message(session).await.unwrap().unwrap();
    let (payload, _) = PayloadCodec::receive(session, report.payload_length)
        .await
        .unwrap();
    (report, payload)
}

#[tokio::test]
async fn test_chunked_payload_is_loaded_in_order() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        let global = Payload::Sequence(vec!["A".to_string(), "B".to_string()]);
        let selection = Selection::with_payload(ClientId::new(3), &global).unwrap();
        assert_eq!(selection.payload_length, Some(2));
        send_message(&mut session, &selection).await.unwrap();
        PayloadCodec::send(&mut session, &global).await.unwrap();
        collect(&mut session).await;
    };

    let (result, ()) = tokio::join!(client.run(), server);
    result.unwrap();

    assert_eq!(calls.configure.load(Ordering::SeqCst), 1);
    assert_eq!(calls.load_data.load(Ordering::SeqCst), 1);
    assert_eq!(
        *calls.payloads.lock().unwrap(),
        vec![Payload::Sequence(vec!["A".to_string(), "B".to_string()])]
    );
}

#[tokio::test]
async fn test_report_precedes_the_trained_payload() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        // no payload: the client trains from what it already holds
        send_message(&mut session, &Selection::new(ClientId::new(3)))
            .await
            .unwrap();
        collect(&mut session).await
    };

    let (result, (report, payload)) = tokio::join!(client.run(), server);
    result.unwrap();

    assert_eq!(
        report,
        ClientReport {
            id: ClientId::new(3),
            report: Report::new(50, 0.91),
            payload: true,
            payload_length: None,
        }
    );
    assert_eq!(payload, Payload::Single("update".to_string()));
    assert!(calls.payloads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_sequence_update_is_announced() {
    let (mut listener, settings) = server(3).await;
    let update = Payload::Sequence(vec!["x".to_string(), "y".to_string(), "z".to_string()]);
    let (learner, _) = TestLearner::new(Training::Succeed(Report::new(7, 0.5), update.clone()));
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        send_message(&mut session, &Selection::new(ClientId::new(3)))
            .await
            .unwrap();
        collect(&mut session).await
    };

    let (result, (report, payload)) = tokio::join!(client.run(), server);
    result.unwrap();
    assert_eq!(report.payload_length, Some(3));
    assert_eq!(payload, update);
}

#[tokio::test]
async fn test_data_is_loaded_once_across_rounds() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        for round in 0..3 {
            let global = Payload::Single(format!("global {}", round));
            send_message(
                &mut session,
                &Selection::with_payload(ClientId::new(3), &global).unwrap(),
            )
            .await
            .unwrap();
            PayloadCodec::send(&mut session, &global).await.unwrap();
            collect(&mut session).await;
        }
    };

    let (result, ()) = tokio::join!(client.run(), server);
    result.unwrap();

    assert_eq!(calls.load_data.load(Ordering::SeqCst), 1);
    assert_eq!(calls.train.load(Ordering::SeqCst), 3);
    assert_eq!(calls.selections.lock().unwrap().len(), 3);
    assert_eq!(
        *calls.payloads.lock().unwrap(),
        vec![
            Payload::Single("global 0".to_string()),
            Payload::Single("global 1".to_string()),
            Payload::Single("global 2".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_foreign_selection_is_a_protocol_violation() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        send_message(&mut session, &Selection::new(ClientId::new(4)))
            .await
            .unwrap();
        session
    };

    let (result, _session) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::Protocol(ProtocolViolation::ForeignSelection { expected, received })) => {
            assert_eq!(expected, ClientId::new(3));
            assert_eq!(received, ClientId::new(4));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(calls.load_data.load(Ordering::SeqCst), 0);
    assert_eq!(calls.train.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_payload_is_a_protocol_violation() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        let selection = Selection {
            payload: Some(true),
            payload_length: Some(2),
            ..Selection::new(ClientId::new(3))
        };
        send_message(&mut session, &selection).await.unwrap();
        PayloadCodec::send(&mut session, &Payload::Sequence(vec!["A".to_string()]))
            .await
            .unwrap();
        session.close().await.unwrap();
    };

    let (result, ()) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::Protocol(ProtocolViolation::MissingPayload {
            expected: 2,
            received: 1,
        })) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(calls.payloads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_huge_announced_payload_is_a_protocol_violation() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        let selection = Selection {
            payload: Some(true),
            payload_length: Some(u32::MAX),
            ..Selection::new(ClientId::new(3))
        };
        send_message(&mut session, &selection).await.unwrap();
        session.close().await.unwrap();
    };

    let (result, ()) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::Protocol(ProtocolViolation::MissingPayload {
            expected: u32::MAX,
            received: 0,
        })) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(calls.payloads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeats_are_sent_while_training_blocks() {
    let (mut listener, settings) = server(3).await;
    let (learner, calls, open) = TestLearner::gated(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        // heartbeats are sent to the same address, on their own connections
        let mut received = heartbeats(listener);
        send_message(&mut session, &Selection::new(ClientId::new(3)))
            .await
            .unwrap();
        assert_eq!(received.recv().await, Some(ClientId::new(3)));
        open.send(()).unwrap();
        collect(&mut session).await
    };

    let (result, (report, _)) = tokio::join!(client.run(), server);
    result.unwrap();
    assert_eq!(report.report, Report::new(50, 0.91));
    assert_eq!(calls.train.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_heartbeats_stop_when_training_fails() {
    time::pause();
    let (mut listener, settings) = server(3).await;
    let addr = listener.local_addr().unwrap();
    let (learner, calls, open) = TestLearner::gated(Training::Fail);
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        let mut received = heartbeats(listener);
        send_message(&mut session, &Selection::new(ClientId::new(3)))
            .await
            .unwrap();
        assert_eq!(received.recv().await, Some(ClientId::new(3)));
        open.send(()).unwrap();
        (session, received)
    };

    let (result, (_session, mut received)) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::Training(e)) => assert_eq!(e.to_string(), "out of memory"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(calls.train.load(Ordering::SeqCst), 1);

    flush(addr, &mut received, ClientId::new(3)).await;
    time::advance(Duration::from_secs(3600)).await;
    assert_eq!(flush(addr, &mut received, ClientId::new(3)).await, 0);
}

#[tokio::test]
async fn test_training_panic_is_contained() {
    let (mut listener, settings) = server(3).await;
    let (learner, _) = TestLearner::new(Training::Panic);
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        send_message(&mut session, &Selection::new(ClientId::new(3)))
            .await
            .unwrap();
        session
    };

    let (result, _session) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::TrainingAborted) => {}
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_unreachable_server_fails_without_retrying() {
    let (listener, settings) = server(3).await;
    drop(listener);
    let (learner, calls) = TestLearner::new(trained());

    let result = Client::new(&settings, learner).unwrap().run().await;
    match result {
        Err(ClientError::Transport(TransportError::Connect { .. })) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(calls.configure.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_garbage_selection_is_a_protocol_violation() {
    let (mut listener, settings) = server(3).await;
    let (learner, _) = TestLearner::new(trained());
    let client = Client::new(&settings, learner).unwrap();

    let server = async move {
        let mut session = accept(&mut listener, 3).await;
        session
            .send_frame(bytes::Bytes::from_static(&[0xff]))
            .await
            .unwrap();
        session
    };

    let (result, _session) = tokio::join!(client.run(), server);
    match result {
        Err(ClientError::Protocol(ProtocolViolation::Decode(_))) => {}
        other => panic!("unexpected result: {:?}", other),
    }
}
