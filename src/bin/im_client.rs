//! IM Client - registers a device, authenticates and optionally sends one
//! message, then prints whatever the gateway pushes back.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use im_gateway::codec::{self, DEFAULT_MAX_FRAME_LEN};
use im_gateway::error::FrameError;
use im_gateway::packet::{AuthInfo, DeviceInfo, MessageType, Packet, ResponseInfo, STATUS_OK};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:12000")]
    addr: String,

    /// Device token to register
    #[arg(short, long, default_value = "device-1")]
    token: String,

    /// User id to authenticate as
    #[arg(short, long)]
    uid: i64,

    /// Shared auth secret
    #[arg(short, long, default_value = "123")]
    secret: String,

    /// Send a P2P message to this uid
    #[arg(long)]
    to: Option<i64>,

    /// Send a GROUP message to this group id
    #[arg(long, conflicts_with_all = ["to", "room"])]
    group: Option<i64>,

    /// Send a ROOM message to this room id
    #[arg(long, conflicts_with = "to")]
    room: Option<i64>,

    /// Message body
    #[arg(short, long, default_value = "hello")]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    println!("[Client] Connecting to {}...", args.addr);
    let stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to {}", args.addr))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // 1. Register
    let device = serde_json::to_vec(&DeviceInfo { token: args.token.clone() })?;
    codec::write_packet(&mut writer, &Packet::new(MessageType::Register).with_payload(device)).await?;
    expect_status(&mut reader, MessageType::RegisterStatus).await?;
    println!("[Register] Device {} registered", args.token);

    // 2. Auth
    let auth = serde_json::to_vec(&AuthInfo {
        uid: args.uid,
        token: args.secret.clone(),
    })?;
    codec::write_packet(&mut writer, &Packet::new(MessageType::Auth).with_payload(auth)).await?;
    expect_status(&mut reader, MessageType::AuthStatus).await?;
    println!("[Auth] Authenticated as uid {}", args.uid);

    // 3. Optional send
    let target = match (args.to, args.group, args.room) {
        (Some(rid), _, _) => Some((MessageType::P2p, rid)),
        (_, Some(rid), _) => Some((MessageType::Group, rid)),
        (_, _, Some(rid)) => Some((MessageType::Room, rid)),
        _ => None,
    };
    if let Some((mt, rid)) = target {
        let packet = Packet::new(mt)
            .with_route(args.uid, rid)
            .with_payload(Bytes::from(args.message.clone()));
        codec::write_packet(&mut writer, &packet).await?;
        println!("[Send] {:?} to {}: {}", mt, rid, args.message);
    }

    println!("[Stream] Waiting for packets...\n");
    loop {
        match codec::read_packet(&mut reader, DEFAULT_MAX_FRAME_LEN).await {
            Ok(packet) => print_packet(&packet),
            Err(FrameError::Closed) => {
                println!("[Info] Server closed connection.");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn expect_status<R>(reader: &mut R, mt: MessageType) -> anyhow::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let packet = codec::read_packet(reader, DEFAULT_MAX_FRAME_LEN).await?;
        if packet.mt != mt.as_i32() {
            print_packet(&packet);
            continue;
        }
        let response = ResponseInfo::decode(&packet.pl).context("undecodable status payload")?;
        if response.status != STATUS_OK {
            bail!("{:?} failed: status {} ({})", mt, response.status, response.msg);
        }
        return Ok(());
    }
}

fn print_packet(packet: &Packet) {
    let kind = packet
        .message_type()
        .map(|mt| format!("{:?}", mt))
        .unwrap_or_else(|_| format!("type {}", packet.mt));
    println!(
        "[{}] mid={} sid={} rid={} body={}",
        kind,
        packet.mid,
        packet.sid,
        packet.rid,
        String::from_utf8_lossy(&packet.pl)
    );
    if !packet.ext.is_empty() {
        let peek_len = packet.ext.len().min(32);
        println!("  Ext peek: {}", hex::encode(&packet.ext[..peek_len]));
    }
}
