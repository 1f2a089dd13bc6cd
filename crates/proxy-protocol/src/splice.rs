//! Bidirectional tunnel splicer.
//!
//! Once a client and an upstream stream are both live, the only job left is
//! to copy bytes in both directions until either side closes — the proxy
//! does not look at the payload again. Modeled after the relay loop used by
//! the in-process SOCKS5 bridge, generalized to any `AsyncRead + AsyncWrite`
//! pair so it also serves HTTP CONNECT tunnels and SSH channels.

use tokio::io::{self, AsyncRead, AsyncWrite};

/// Splice `a` and `b` together until either direction ends.
///
/// The two copy directions race via `select!`. Whichever finishes first —
/// by EOF or by error — wins, and the other direction's halves are dropped
/// rather than waited on: this closes both streams outright, same as the
/// grounding source's `defer a.Close()` / `defer b.Close()`, instead of
/// merely shutting down one write half and hoping the remaining peer
/// reciprocates by closing its own read side.
pub async fn splice<A, B>(a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ar, mut aw) = io::split(a);
    let (mut br, mut bw) = io::split(b);

    tokio::select! {
        _ = io::copy(&mut ar, &mut bw) => {}
        _ = io::copy(&mut br, &mut aw) => {}
    }

    drop(ar);
    drop(aw);
    drop(br);
    drop(bw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _, duplex};

    #[tokio::test]
    async fn copies_both_directions_and_unblocks_on_eof() {
        let (client, mut client_remote) = duplex(64);
        let (upstream, mut upstream_remote) = duplex(64);

        let splice_task = tokio::spawn(splice(client, upstream));

        client_remote.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 32];
        let n = upstream_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello upstream");

        upstream_remote.write_all(b"hello client").await.unwrap();
        let n = client_remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello client");

        drop(client_remote);
        drop(upstream_remote);

        tokio::time::timeout(std::time::Duration::from_secs(1), splice_task)
            .await
            .expect("splice should finish once both peers are dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn one_side_closing_terminates_the_other_even_if_its_peer_never_closes() {
        let (client, client_remote) = duplex(64);
        let (upstream, upstream_remote) = duplex(64);

        let splice_task = tokio::spawn(splice(client, upstream));

        // Only the client side goes away. The upstream remote is kept alive
        // and never closes or writes again — a peer that ignores the FIN.
        // The loser direction (upstream -> client) must still be dropped
        // rather than left blocked on a read that will never complete.
        drop(client_remote);
        let _keep_alive = upstream_remote;

        tokio::time::timeout(std::time::Duration::from_secs(1), splice_task)
            .await
            .expect("splice should terminate once one side ends, regardless of the other peer")
            .unwrap();
    }
}
