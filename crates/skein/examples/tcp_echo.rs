//! TCP echo example: the acceptor echoes every stream back to its sender.
//!
//! Run with: cargo run --example tcp_echo
//!
//! This spawns an acceptor on a random port, connects to it, opens a named
//! stream and round-trips one message.

use skein::{Multiplex, Role};
use tokio::net::{TcpListener, TcpStream};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(run())
}

async fn run() -> Result<(), BoxError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    println!("Listening on {addr}");

    let acceptor = tokio::spawn(run_acceptor(listener));

    let transport = TcpStream::connect(addr).await?;
    let mux = Multiplex::new(transport, Role::Initiator);
    let serving = tokio::spawn({
        let mux = mux.clone();
        async move { mux.serve(|_stream| async {}).await }
    });

    let mut stream = mux.new_named_stream("echo").await?;
    let message = b"hello through the weave";
    stream.write(message).await?;

    let mut echoed = [0u8; 23];
    stream.read(&mut echoed).await?;
    println!("Echoed back: {}", String::from_utf8_lossy(&echoed));
    assert_eq!(&echoed, message);

    mux.close()?;
    let _ = serving.await?;
    acceptor.await??;

    println!("Done!");
    Ok(())
}

async fn run_acceptor(listener: TcpListener) -> Result<(), BoxError> {
    let (socket, peer_addr) = listener.accept().await?;
    println!("Accepted connection from {peer_addr}");

    let mux = Multiplex::new(socket, Role::Acceptor);
    mux.serve(|mut stream| async move {
        println!("Echoing stream {:?} ({})", stream.name(), stream.id());
        let mut buf = [0u8; 1];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
    .await?;

    Ok(())
}
