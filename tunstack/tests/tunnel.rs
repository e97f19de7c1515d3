use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};
use tunstack::tunnel::{run, TunnelError, TunnelOptions};
use tunstack_core::protocols::{
    icmp::{icmp_parsing::IcmpHeader, ECHO_REPLY, ECHO_REQUEST},
    ipv4::{protocol_number, Ipv4Address, Ipv4Header, Ipv4HeaderBuilder},
};

const SERVER: Ipv4Address = Ipv4Address::new([10, 0, 0, 1]);
const LOCAL: Ipv4Address = Ipv4Address::new([10, 0, 0, 2]);

const OPTIONS: TunnelOptions = TunnelOptions {
    link_overhead: 4,
    buffer_until_push: false,
    fetch: None,
};

fn ping_frame() -> anyhow::Result<Vec<u8>> {
    let data = b"tunnel ping";
    let mut icmp = IcmpHeader::new(ECHO_REQUEST, 0, [0, 1, 0, 2]).serialize(data.iter().cloned());
    icmp.extend_from_slice(data);
    let mut frame = Ipv4HeaderBuilder::new(SERVER, LOCAL, protocol_number::ICMP, icmp.len() as u16)
        .build()?
        .serialize();
    frame.extend_from_slice(&icmp);
    Ok(frame)
}

#[tokio::test]
async fn answers_ping_through_the_tunnel() -> anyhow::Result<()> {
    let (client, mut server) = duplex(64 * 1024);
    let (reader, writer) = split(client);
    let frame = ping_frame()?;

    let server_side = async move {
        server.write_all(b"10.0.0.1|10.0.0.2|1504\n").await?;
        server.write_u16(frame.len() as u16).await?;
        server.write_all(&frame).await?;

        let len = server.read_u16().await?;
        let mut reply = vec![0; len as usize];
        server.read_exact(&mut reply).await?;
        drop(server);
        anyhow::Ok(reply)
    };

    let (result, reply) = tokio::join!(run(reader, writer, OPTIONS), server_side);
    result?;
    let reply = reply?;

    let ip = Ipv4Header::from_bytes(reply.iter().cloned())?;
    assert_eq!(ip.source, LOCAL);
    assert_eq!(ip.destination, SERVER);
    let icmp = IcmpHeader::from_bytes(reply[20..].iter().cloned())?;
    assert_eq!(icmp.icmp_type, ECHO_REPLY);
    assert_eq!(icmp.rest, [0, 1, 0, 2]);
    assert_eq!(&reply[28..], b"tunnel ping");
    Ok(())
}

#[tokio::test]
async fn rejects_a_bad_handshake() {
    let (client, mut server) = duplex(1024);
    let (reader, writer) = split(client);
    server.write_all(b"10.0.0.1|not an address|1500\n").await.unwrap();
    let result = run(reader, writer, OPTIONS).await;
    assert!(matches!(result, Err(TunnelError::Handshake(_))));
}

#[tokio::test]
async fn requires_a_handshake() {
    let (client, server) = duplex(1024);
    let (reader, writer) = split(client);
    drop(server);
    let result = run(reader, writer, OPTIONS).await;
    assert!(matches!(result, Err(TunnelError::NoHandshake)));
}
