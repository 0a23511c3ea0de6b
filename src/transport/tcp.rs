//! TCP dialing

use std::time::Duration;

use tokio::net::TcpStream;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

/// Default dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a raw TCP connection to the address.
pub async fn dial(addr: &Address) -> Result<Stream> {
    let connect = async {
        let stream = match addr {
            Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await?,
            Address::Domain(domain, port) => {
                TcpStream::connect(format!("{}:{}", domain, port)).await?
            }
        };

        // Disable Nagle's algorithm for lower latency
        stream.set_nodelay(true)?;

        Ok::<_, Error>(stream)
    };

    match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(Error::Dial(e.to_string())),
        Err(_) => Err(Error::Dial(format!("connect to {} timed out", addr))),
    }
}

/// Enable keepalive on an accepted socket.
pub fn set_keepalive(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}
