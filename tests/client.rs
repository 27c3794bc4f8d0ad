#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use hyper_agent::{
    request, stream, Agent, Client, ClientOptions, Dispatch, DispatchOptions, Error, Event,
    Handler, Pool, RequestOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello";

struct Server {
    addr: SocketAddr,
    heads: mpsc::UnboundedReceiver<String>,
}

impl Server {
    fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Answers every request head with `response` on a keep-alive connection.
///
/// An empty `response` never answers. With `hold`, the connection is closed
/// after the first response once `hold` is notified.
async fn serve(response: &'static str, hold: Option<Arc<Notify>>) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, heads) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (mut tcp, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tx = tx.clone();
            let hold = hold.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(head) = read_head(&mut tcp, &mut buf).await {
                    let _ = tx.send(head);
                    if response.is_empty() {
                        continue;
                    }
                    if tcp.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                    if let Some(ref hold) = hold {
                        hold.notified().await;
                        return;
                    }
                }
            });
        }
    });

    Server { addr, heads }
}

async fn read_head(tcp: &mut TcpStream, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.drain(..end + 4).collect::<Vec<_>>();
            return Some(String::from_utf8_lossy(&head).into_owned());
        }
        let mut chunk = [0u8; 1024];
        match tcp.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Reports a request's outcome on a channel.
struct Report {
    tx: mpsc::UnboundedSender<Result<(StatusCode, Bytes), Error>>,
    status: StatusCode,
    body: BytesMut,
}

impl Handler for Report {
    fn on_headers(&mut self, status: StatusCode, _: &HeaderMap) {
        self.status = status;
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.body.extend_from_slice(&chunk);
    }

    fn on_complete(&mut self, _: Option<HeaderMap>) {
        let body = std::mem::take(&mut self.body).freeze();
        let _ = self.tx.send(Ok((self.status, body)));
    }

    fn on_error(&mut self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

fn report(tx: &mpsc::UnboundedSender<Result<(StatusCode, Bytes), Error>>) -> Box<dyn Handler> {
    Box::new(Report {
        tx: tx.clone(),
        status: StatusCode::OK,
        body: BytesMut::new(),
    })
}

fn events(pool: &dyn Pool) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    // Kept attached for the rest of the test.
    let _subscription = pool.subscribe(Arc::new(move |event: &Event| {
        let _ = tx.send(event.clone());
    }));
    rx
}

async fn until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn agent_round_trip() {
    let mut server = serve(OK, None).await;
    let agent = Arc::new(Agent::new());
    let mut events = events(&*agent);

    let res = request(
        &format!("{}/hello?x=1", server.origin()),
        RequestOptions::with_dispatcher(agent.clone()),
    )
    .unwrap()
    .await
    .unwrap();
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body, "hello");

    let head = server.heads.recv().await.unwrap();
    assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{head}");
    assert!(
        head.to_ascii_lowercase()
            .contains(&format!("host: {}\r\n", server.addr)),
        "{head}"
    );

    match events.recv().await.unwrap() {
        Event::Connect {
            origin,
            participants,
        } => {
            assert_eq!(origin, server.origin());
            // client, pool, agent
            assert_eq!(participants.len(), 3);
            assert_eq!(participants.last(), Some(&agent.id()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(agent.origins(), [server.origin()]);
}

#[tokio::test]
async fn idle_pool_is_evicted_when_server_closes() {
    let hold = Arc::new(Notify::new());
    let server = serve(OK, Some(hold.clone())).await;
    let agent = Arc::new(Agent::new());
    let mut events = events(&*agent);

    let res = request(&server.origin(), RequestOptions::with_dispatcher(agent.clone()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res.body, "hello");
    until(|| agent.size() == 0).await;
    assert_eq!(agent.connected(), 1);

    hold.notify_one();
    loop {
        match events.recv().await.unwrap() {
            Event::Disconnect { error, .. } => {
                assert!(error.is_informational());
                break;
            }
            _ => continue,
        }
    }
    assert!(agent.origins().is_empty());
    assert_eq!(agent.connected(), 0);

    // The next request creates a fresh pool.
    let res = request(&server.origin(), RequestOptions::with_dispatcher(agent.clone()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res.body, "hello");
    assert_eq!(agent.origins(), [server.origin()]);
}

#[tokio::test]
async fn connect_failure_reaches_handler_and_evicts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let agent = Arc::new(Agent::new());
    let mut events = events(&*agent);
    let err = request(&origin, RequestOptions::with_dispatcher(agent.clone()))
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_connect());

    match events.recv().await.unwrap() {
        Event::Disconnect { error, .. } => assert!(error.is_connect()),
        other => panic!("unexpected {other:?}"),
    }
    assert!(agent.origins().is_empty());
}

#[tokio::test]
async fn client_serves_requests_in_order_and_closes() {
    let mut server = serve(OK, None).await;
    let client = Client::new(&server.origin(), &ClientOptions::default()).unwrap();
    let (tx, mut results) = mpsc::unbounded_channel();

    for path in ["/1", "/2", "/3"] {
        let mut options = DispatchOptions::new(server.origin());
        options.path = path.to_owned();
        client.dispatch(options, report(&tx)).unwrap();
    }
    assert_eq!(client.size(), 3);

    client.close().await.unwrap();
    for _ in 0..3 {
        let (status, body) = results.recv().await.unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");
    }
    for path in ["/1", "/2", "/3"] {
        let head = server.heads.recv().await.unwrap();
        assert!(head.starts_with(&format!("GET {path} HTTP/1.1")), "{head}");
    }
    assert_eq!(client.connected(), 0);
    assert_eq!(client.size(), 0);

    let err = client
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test]
async fn client_emits_drain_after_busy() {
    let server = serve(OK, None).await;
    let client = Client::new(&server.origin(), &ClientOptions::default()).unwrap();
    let mut events = events(&client);
    let (tx, mut results) = mpsc::unbounded_channel();

    let ready = client
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap();
    assert!(!ready);
    results.recv().await.unwrap().unwrap();

    let mut saw_connect = false;
    loop {
        match events.recv().await.unwrap() {
            Event::Connect { participants, .. } => {
                assert_eq!(participants, [client.id()]);
                saw_connect = true;
            }
            Event::Drain { origin } => {
                assert_eq!(origin, server.origin());
                break;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(saw_connect);
    client.destroy().await.unwrap();
}

#[tokio::test]
async fn destroy_fails_queued_and_in_flight_requests() {
    let server = serve("", None).await;
    let client = Client::new(&server.origin(), &ClientOptions::default()).unwrap();
    let (tx, mut results) = mpsc::unbounded_channel();

    client
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap();
    client
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap();
    until(|| client.running() == 1 && client.connected() == 1).await;
    assert_eq!(client.pending(), 1);

    client.destroy().await.unwrap();
    for _ in 0..2 {
        assert!(results.recv().await.unwrap().unwrap_err().is_destroyed());
    }
    assert_eq!(client.size(), 0);
    assert_eq!(client.connected(), 0);
}

#[tokio::test]
async fn stream_reads_chunked_body() {
    let server = serve(
        "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        None,
    )
    .await;
    let agent = Arc::new(Agent::new());

    let mut res = stream(
        &format!("{}/stream", server.origin()),
        RequestOptions::with_dispatcher(agent),
    )
    .unwrap()
    .await
    .unwrap();
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body.collect().await.unwrap(), "hello world");
}

/// Reads the agent from inside `on_error`, the way a caller retrying or
/// logging load would.
struct ReadsAgent {
    agent: Arc<Agent>,
    tx: mpsc::UnboundedSender<(Error, usize)>,
}

impl Handler for ReadsAgent {
    fn on_error(&mut self, err: Error) {
        let size = self.agent.size() + self.agent.connected();
        let _ = self.tx.send((err, size));
    }
}

#[tokio::test]
async fn destroy_handlers_may_reenter_the_agent() {
    for connections in [Some(1), None] {
        let agent = Arc::new(
            Agent::builder()
                .options(ClientOptions {
                    connections,
                    ..ClientOptions::default()
                })
                .build(),
        );
        let (tx, mut errors) = mpsc::unbounded_channel();
        for _ in 0..2 {
            let handler = ReadsAgent {
                agent: agent.clone(),
                tx: tx.clone(),
            };
            agent
                .dispatch(DispatchOptions::new("http://127.0.0.1:1"), Box::new(handler))
                .unwrap();
        }

        agent.destroy().await.unwrap();
        for _ in 0..2 {
            let (err, _) = errors.recv().await.unwrap();
            assert!(err.is_destroyed(), "{err:?}");
        }
        assert_eq!(agent.size(), 0);
    }
}

#[tokio::test]
async fn drain_listener_may_dispatch_to_the_agent() {
    let mut server = serve(OK, None).await;
    let agent = Arc::new(
        Agent::builder()
            .options(ClientOptions {
                connections: Some(1),
                ..ClientOptions::default()
            })
            .build(),
    );
    let (tx, mut results) = mpsc::unbounded_channel();

    let weak = Arc::downgrade(&agent);
    let origin = server.origin();
    let follow_up = tx.clone();
    let once = AtomicBool::new(false);
    let _subscription = agent.subscribe(Arc::new(move |event: &Event| {
        if !matches!(event, Event::Drain { .. }) || once.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(agent) = weak.upgrade() {
            let mut options = DispatchOptions::new(origin.clone());
            options.path = "/again".to_owned();
            agent.dispatch(options, report(&follow_up)).unwrap();
            assert_eq!(agent.size(), 1);
        }
    }));

    let ready = agent
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap();
    assert!(!ready);

    for _ in 0..2 {
        let (status, body) = results.recv().await.unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");
    }
    assert!(server.heads.recv().await.unwrap().starts_with("GET / "));
    assert!(server.heads.recv().await.unwrap().starts_with("GET /again "));
}

#[tokio::test]
async fn disconnect_listener_may_dispatch_to_the_agent() {
    let hold = Arc::new(Notify::new());
    let server = serve(OK, Some(hold.clone())).await;
    let agent = Arc::new(Agent::new());
    let (tx, mut results) = mpsc::unbounded_channel();

    let weak = Arc::downgrade(&agent);
    let follow_up = tx.clone();
    let _subscription = agent.subscribe(Arc::new(move |event: &Event| {
        let origin = match event {
            Event::Disconnect { origin, .. } => origin.clone(),
            _ => return,
        };
        if let Some(agent) = weak.upgrade() {
            if agent.origins().is_empty() {
                agent
                    .dispatch(DispatchOptions::new(origin), report(&follow_up))
                    .unwrap();
            }
        }
    }));

    agent
        .dispatch(DispatchOptions::new(server.origin()), report(&tx))
        .unwrap();
    results.recv().await.unwrap().unwrap();
    until(|| agent.size() == 0).await;

    // The server closes the idle connection; the listener sends a new request
    // from inside the relayed disconnect.
    hold.notify_one();
    let (status, body) = results.recv().await.unwrap().unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "hello");
    assert_eq!(agent.origins(), [server.origin()]);
}

#[tokio::test]
async fn scheme_case_shares_the_pool() {
    let server = serve(OK, None).await;
    let agent = Arc::new(Agent::new());
    let port = server.addr.port();

    for url in [
        format!("http://127.0.0.1:{port}/a"),
        format!("HTTP://127.0.0.1:{port}/b"),
    ] {
        let res = request(&url, RequestOptions::with_dispatcher(agent.clone()))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(res.body, "hello");
    }
    assert_eq!(agent.origins(), [server.origin()]);
}
