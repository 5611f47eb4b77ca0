use sock_pool::tcp::{TcpFactory, TcpOptions};
use sock_pool::{Error, Pool, PoolConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

async fn echo_server() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    Ok(port)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let port = echo_server().await?;
    let pool = Pool::new(
        TcpFactory,
        TcpOptions::new("127.0.0.1", port).lifetime(Duration::from_secs(1)),
        PoolConfig::new()
            .max_connections(4)
            .initial_connections(2)
            .reap_interval(Duration::from_millis(500)),
    )
    .await?;
    println!("state = {}", pool.state());

    let echoed: Result<Vec<u8>, Error<std::io::Error>> = pool
        .with_connection(|conn| {
            Box::pin(async move {
                let mut tcp = conn.lock().await;
                tcp.send(b"hello").await.map_err(Error::Connection)?;
                tcp.recv(1024).await.map_err(Error::Connection)
            })
        })
        .await;
    println!("echoed = {}", String::from_utf8_lossy(&echoed?));

    {
        let conn = pool.connection().await?;
        let mut tcp = conn.lock().await;
        tcp.send(b"world").await?;
        println!("echoed = {}", String::from_utf8_lossy(&tcp.recv(1024).await?));
        println!("state = {}", pool.state());
    }

    // let the reaper evict the connections past their lifetime
    tokio::time::sleep(Duration::from_secs(2)).await;
    println!("state = {}", pool.state());
    pool.close().await;
    Ok(())
}
