//! Very simple example in which the "server" engine has a processor for request code 1, which
//! answers with whatever body it was sent.
use remoting::{Command, InvocationEngine, RemotingCodec, RemotingConfig, ResponseCode, Transport, processor_fn};
use std::time::Duration;
use tokio::io::duplex;
use tokio_util::codec::Framed;

const ECHO: i32 = 1;

#[tokio::main]
async fn main() {
    // Create a pair of connected pipes that will serve as the transport between client and server
    let (client, server) = duplex(64 * 1024);

    // Create framed transports with a reasonable max frame size to avoid DoS vulns
    let client_transport = Framed::new(client, RemotingCodec::new_with_max_length(1024 * 1024));
    let server_transport = Framed::new(server, RemotingCodec::new_with_max_length(1024 * 1024));

    let server = InvocationEngine::new(RemotingConfig::default());
    server.register_processor(
        ECHO,
        processor_fn(|_ctx, request: Command| async move {
            Ok(Some(
                Command::response_to(&request, ResponseCode::Success).with_body(request.body.clone()),
            ))
        }),
        None,
    );
    let server_connection = server
        .serve_connection(server_transport.with_remote_peer("client"))
        .unwrap();

    let client = InvocationEngine::new(RemotingConfig::default());
    let connection = client
        .serve_connection(client_transport.with_remote_peer("server"))
        .unwrap();

    for message in ["Hello, world!", "foo bar", "1 2 3"] {
        let request = Command::request(ECHO).with_body(message);
        let response = client
            .call_sync(&connection, request, Duration::from_secs(3))
            .await
            .and_then(Command::into_result)
            .unwrap();
        assert_eq!(&response.body[..], message.as_bytes());
        println!("echoed {message:?}");
    }

    // Shutdown the server connection
    server_connection.shutdown().await;

    // No more requests should be accepted
    connection.closed().await;
    assert!(
        client
            .call_sync(&connection, Command::request(ECHO), Duration::from_secs(3))
            .await
            .is_err()
    );

    client.shutdown().await;
    server.shutdown().await;
}
