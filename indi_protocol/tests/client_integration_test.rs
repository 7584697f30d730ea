//! End-to-end tests of the client against a scripted INDI server over TCP

mod common;

use common::{MockIndiServer, DEF_CCD1, DEF_EXPOSURE};
use indi_protocol::{
    ClientConfig, Event, IndiClient, IndiError, Poller, PropertyPerm, PropertyState, VectorKind,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn connect(port: u16) -> IndiClient {
    let config = ClientConfig {
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::new("127.0.0.1", port)
    };
    IndiClient::connect_with_config(config).expect("Failed to connect to mock server")
}

#[test_log::test]
fn test_exposure_busy_then_ok() {
    let server = MockIndiServer::start(|session| {
        session.expect("<getProperties version=\"1.7\"/>");
        session.send(DEF_EXPOSURE);

        let command = session.expect("</newNumberVector>");
        assert!(command.contains("<newNumberVector device=\"CCD\" name=\"CCD_EXPOSURE\">"));
        assert!(command.contains("<oneNumber name=\"CCD_EXPOSURE_VALUE\">5</oneNumber>"));

        session.send(r#"<setNumberVector device="CCD" name="CCD_EXPOSURE" state="Busy" timeout="60"><oneNumber name="CCD_EXPOSURE_VALUE">5</oneNumber></setNumberVector>"#);
        thread::sleep(Duration::from_millis(100));
        session.send(r#"<setNumberVector device="CCD" name="CCD_EXPOSURE" state="Ok" timeout="60"><oneNumber name="CCD_EXPOSURE_VALUE">5</oneNumber></setNumberVector>"#);
        thread::sleep(Duration::from_millis(100));
    });

    let mut client = connect(server.port);
    client.get_properties(None).unwrap();

    let vector = client
        .wait_for("CCD", "CCD_EXPOSURE", Duration::from_secs(5), |_| true)
        .unwrap();
    assert_eq!(vector.kind(), VectorKind::Number);
    assert_eq!(vector.perm, PropertyPerm::ReadWrite);
    assert_eq!(vector.group, "Main Control");
    assert_eq!(
        client.get_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE"),
        Some(0.0)
    );

    client
        .set_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 5.0)
        .unwrap();
    let state = client
        .wait_for_completion("CCD", "CCD_EXPOSURE", Duration::from_secs(5))
        .unwrap();

    assert_eq!(state, PropertyState::Ok);
    assert_eq!(
        client.get_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE"),
        Some(5.0)
    );
    assert_eq!(
        client.get_vector("CCD", "CCD_EXPOSURE").unwrap().state,
        PropertyState::Ok
    );

    let updates: Vec<PropertyState> = client
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Updated { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![PropertyState::Busy, PropertyState::Ok]);

    client.disconnect();
    server.join();
}

#[test_log::test]
fn test_blob_frame_split_across_reads() {
    let server = MockIndiServer::start(|session| {
        session.expect("<getProperties");
        session.send(DEF_CCD1);
        session.expect("<enableBLOB device=\"CCD\">Also</enableBLOB>");

        // "hello world!" wrapped over two lines and trickled out a few bytes at a time
        let frame = r#"<setBLOBVector device="CCD" name="CCD1" state="Ok" timeout="60">
    <oneBLOB name="CCD1" size="12" format=".fits">
aGVsbG8g
d29ybGQh
    </oneBLOB>
</setBLOBVector>
"#;
        session.send_in_chunks(frame, 7, Duration::from_millis(2));
        thread::sleep(Duration::from_millis(100));
    });

    let mut client = connect(server.port);
    client.get_properties(None).unwrap();

    client
        .wait_for("CCD", "CCD1", Duration::from_secs(5), |v| {
            v.state == PropertyState::Ok
        })
        .unwrap();

    let blob = client.get_blob("CCD", "CCD1", "CCD1").expect("No frame received");
    assert_eq!(blob.data, b"hello world!");
    assert_eq!(blob.size, 12);
    assert_eq!(blob.format, ".fits");

    let received = client
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, Event::BlobReceived { size: 12, .. }));
    assert!(received);

    server.join();
}

#[test_log::test]
fn test_bad_traffic_is_skipped_and_session_continues() {
    let server = MockIndiServer::start(|session| {
        session.expect("<getProperties");
        session.send(r#"<setNumberVector device="CCD" name="UNKNOWN" state="Ok"><oneNumber name="X">1</oneNumber></setNumberVector>"#);
        session.send(r#"<defNumberVector device="CCD" name="BROKEN" state="Idle" perm="rw"><defNumber name="A">1</defText></defNumberVector>"#);
        session.send(r#"<message device="CCD" message="Cooler at &lt;-10&gt; C"/>"#);
        session.send(DEF_EXPOSURE);
        thread::sleep(Duration::from_millis(100));
    });

    let mut client = connect(server.port);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    client.on_message(move |m| sink.lock().unwrap().push(m.message.clone()));
    client.get_properties(None).unwrap();

    client
        .wait_for("CCD", "CCD_EXPOSURE", Duration::from_secs(5), |_| true)
        .unwrap();

    assert!(client.is_connected());
    assert!(client.get_vector("CCD", "UNKNOWN").is_none());
    assert!(client.get_vector("CCD", "BROKEN").is_none());
    assert_eq!(
        *messages.lock().unwrap(),
        vec!["Cooler at <-10> C".to_string()]
    );

    let rejected = client
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::Rejected { .. }))
        .count();
    assert!(rejected >= 2, "expected rejections, got {}", rejected);

    server.join();
}

#[test_log::test]
fn test_server_disconnect_is_fatal() {
    let server = MockIndiServer::start(|session| {
        session.expect("<getProperties");
        session.send(DEF_EXPOSURE);
        // Script ends and the stream is dropped
    });

    let mut client = connect(server.port);
    client.get_properties(None).unwrap();
    server.join();

    let deadline = Instant::now() + Duration::from_secs(5);
    let error = loop {
        match client.process_events(Duration::from_millis(100)) {
            Ok(_) => assert!(Instant::now() < deadline, "disconnect never detected"),
            Err(e) => break e,
        }
    };

    assert!(matches!(error, IndiError::Connection(_)));
    assert!(error.is_fatal());
    assert!(!client.is_connected());
    // The mirror stays as last observed
    assert!(client.get_vector("CCD", "CCD_EXPOSURE").is_some());
}

#[test_log::test]
fn test_reconnect_starts_a_fresh_session() {
    let server = MockIndiServer::start_sessions(2, |index, session| {
        session.expect("<getProperties version=\"1.7\"/>");
        session.send(DEF_CCD1);
        if index == 0 {
            session.send(DEF_EXPOSURE);
        }
        session.expect("<enableBLOB device=\"CCD\">Also</enableBLOB>");
        if index == 0 {
            session.expect("</newNumberVector>");
        } else {
            thread::sleep(Duration::from_millis(200));
        }
    });

    let mut client = connect(server.port);
    client.get_properties(None).unwrap();
    client
        .wait_for("CCD", "CCD_EXPOSURE", Duration::from_secs(5), |_| true)
        .unwrap();
    client
        .set_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 1.0)
        .unwrap();

    // First session ends once the server has seen the command
    let deadline = Instant::now() + Duration::from_secs(5);
    let lost = loop {
        match client.process_events(Duration::from_millis(100)) {
            Err(e) => break e,
            Ok(_) => assert!(Instant::now() < deadline, "server never hung up"),
        }
    };
    assert!(matches!(lost, IndiError::Connection(_)));
    assert!(!client.is_connected());

    client.reconnect().unwrap();
    assert!(client.is_connected());
    assert!(client.model().is_empty());

    // Definitions and the BLOB setting have to be negotiated again
    client.get_properties(None).unwrap();
    client
        .wait_for("CCD", "CCD1", Duration::from_secs(5), |_| true)
        .unwrap();
    assert!(client.get_vector("CCD", "CCD_EXPOSURE").is_none());

    client.disconnect();
    server.join();
}

#[test_log::test]
fn test_connect_to_closed_port_fails() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let result = IndiClient::connect("127.0.0.1", port);
    assert!(matches!(result, Err(IndiError::Connection(_))));
}

#[test_log::test]
fn test_poller_keeps_shared_client_current() {
    let server = MockIndiServer::start(|session| {
        session.expect("<getProperties");
        session.send(DEF_EXPOSURE);
        session.expect("</newNumberVector>");
        session.send(r#"<setNumberVector device="CCD" name="CCD_EXPOSURE" state="Ok"><oneNumber name="CCD_EXPOSURE_VALUE">2.5</oneNumber></setNumberVector>"#);
        thread::sleep(Duration::from_millis(300));
    });

    let client = Arc::new(Mutex::new(connect(server.port)));
    client.lock().unwrap().get_properties(None).unwrap();
    let mut poller = Poller::spawn(client.clone(), Duration::from_millis(10));

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.lock().unwrap().get_vector("CCD", "CCD_EXPOSURE").is_none() {
        assert!(Instant::now() < deadline, "definition never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    client
        .lock()
        .unwrap()
        .set_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 2.5)
        .unwrap();

    while client.lock().unwrap().get_number("CCD", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE") != Some(2.5)
    {
        assert!(Instant::now() < deadline, "update never arrived");
        thread::sleep(Duration::from_millis(10));
    }

    poller.stop();
    assert!(!poller.is_running());
    server.join();
}
