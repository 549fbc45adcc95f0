use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use trn_relay_lib::net::{CType, Port, PortMode, PortSettings};
use trn_relay_lib::proto::commst::{CommstMsg, CommstOptions, CommstType, TRN_MSG_SIZE};
use trn_relay_lib::proto::trnmsg::{TrnMsg, TrnMsgId, TRNMSG_HDR_LEN};
use trn_relay_lib::proto::{CommstProtocol, TrnmsgProtocol};
use trn_relay_lib::telemetry::{PortStats, SessionLog};
use trn_relay_lib::trn::{BenchFilter, MeasBeam, Measurement};

const IO_TMOUT: Duration = Duration::from_secs(5);

fn settings(name: &str, mode: PortMode, hbto_sec: f64) -> PortSettings {
    PortSettings {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        ctype: CType::Tcp,
        mode,
        hbto_sec,
        delay_ms: 5,
    }
}

async fn spawn_commst(hbto_sec: f64) -> (SocketAddr, watch::Sender<bool>, Arc<PortStats>) {
    let (stop, rx) = watch::channel(false);
    let proto = CommstProtocol::new(BenchFilter::new(), CommstOptions::default());
    let mut port = Port::new(settings("trn", PortMode::ReqRes, hbto_sec), SessionLog::null(), proto, rx);
    port.connect().await.unwrap();
    let addr = port.local_addr().unwrap();
    let stats = port.stats();
    tokio::spawn(port.run());
    (addr, stop, stats)
}

async fn spawn_trnmsg() -> (SocketAddr, watch::Sender<bool>, Arc<PortStats>) {
    let (stop, rx) = watch::channel(false);
    let proto = TrnmsgProtocol::new(BenchFilter::new());
    let mut port = Port::new(
        settings("trnmsg", PortMode::ReqRes, 0.0),
        SessionLog::null(),
        proto,
        rx,
    );
    port.connect().await.unwrap();
    let addr = port.local_addr().unwrap();
    let stats = port.stats();
    tokio::spawn(port.run());
    (addr, stop, stats)
}

async fn commst_request(cli: &mut TcpStream, msg: &CommstMsg) -> CommstMsg {
    let blob = msg.serialize(TRN_MSG_SIZE).unwrap();
    cli.write_all(&blob).await.unwrap();
    let mut reply = vec![0u8; TRN_MSG_SIZE];
    timeout(IO_TMOUT, cli.read_exact(&mut reply))
        .await
        .expect("reply timed out")
        .unwrap();
    CommstMsg::deserialize(&reply).unwrap()
}

#[tokio::test]
async fn commst_ping_cycle() {
    let (addr, stop, stats) = spawn_commst(0.0).await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::Ping)).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Ack));

    let snap = stats.snapshot();
    assert_eq!(snap.cli_con, 1);
    assert_eq!(snap.rx_bytes, TRN_MSG_SIZE as u64);
    assert_eq!(snap.tx_bytes, TRN_MSG_SIZE as u64);
    stop.send(true).unwrap();
}

#[tokio::test]
async fn commst_full_dispatch_table() {
    let (addr, stop, _stats) = spawn_commst(0.0).await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    // not initialized yet
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::IsInit)).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Ack));
    assert_eq!(reply.parameter, 0);

    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::Init)).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Ack));
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::IsInit)).await;
    assert_eq!(reply.parameter, 1);

    // measurement echo
    let mut meas_msg = CommstMsg::of_type(CommstType::Meas);
    meas_msg.parameter = 1;
    meas_msg.meas = Measurement {
        time: 100.0,
        data_type: 1,
        ping_number: 9,
        beams: vec![MeasBeam {
            beam_num: 0,
            range: 55.0,
            cross: 0.5,
            along: -0.5,
            altitude: 54.0,
        }],
    };
    let reply = commst_request(&mut cli, &meas_msg).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Meas));
    assert_eq!(reply.meas.ping_number, 9);
    assert_eq!(reply.meas.beams.len(), 1);

    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::LastMeas)).await;
    assert_eq!(reply.parameter, 1);

    // motion + pose estimates
    let mut motn = CommstMsg::of_type(CommstType::Motn);
    motn.est.x = 12.0;
    motn.est.y = -3.0;
    let reply = commst_request(&mut cli, &motn).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Ack));
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::Mle)).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Mle));
    assert_eq!(reply.est.x, 12.0);
    assert_eq!(reply.est.covariance[0], 1.0);
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::Mmse)).await;
    assert_eq!(reply.est.covariance[0], 0.5);

    // queries and setters
    for (req, expect_param) in [
        (CommstType::NReinits, 0),
        (CommstType::FiltType, 0),
        (CommstType::FiltState, 1),
        (CommstType::OutMeas, 0),
        (CommstType::IsConv, 0),
    ] {
        let reply = commst_request(&mut cli, &CommstMsg::of_type(req)).await;
        assert_eq!(reply.msg_type(), Some(CommstType::Ack), "{req:?}");
        assert_eq!(reply.parameter, expect_param, "{req:?}");
    }

    for req in [
        CommstMsg::ptype(CommstType::SetMw, 2),
        CommstMsg::ptype(CommstType::SetFr, 1),
        CommstMsg::ptype(CommstType::SetIma, 1),
        CommstMsg::ptype(CommstType::SetMim, 3),
        CommstMsg::ptype(CommstType::FiltGrd, 1),
        CommstMsg::of_type(CommstType::SetVdr),
        CommstMsg::of_type(CommstType::FiltReinit),
    ] {
        let reply = commst_request(&mut cli, &req).await;
        assert_eq!(reply.msg_type(), Some(CommstType::Ack));
    }

    // lowgrade filter was selected by FiltGrd param 1
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::FiltType)).await;
    assert_eq!(reply.parameter, 1);
    // FiltReinit bumped the counter
    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::NReinits)).await;
    assert_eq!(reply.parameter, 1);

    // unknown type draws NACK
    let mut junk = CommstMsg::of_type(CommstType::Ping);
    junk.msg_type = b'?';
    let reply = commst_request(&mut cli, &junk).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Nack));

    stop.send(true).unwrap();
}

#[tokio::test]
async fn commst_reader_tolerates_chunked_writes() {
    let (addr, stop, _stats) = spawn_commst(0.0).await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    let blob = CommstMsg::of_type(CommstType::Ping)
        .serialize(TRN_MSG_SIZE)
        .unwrap();
    let (head, tail) = blob.split_at(1000);
    cli.write_all(head).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    cli.write_all(tail).await.unwrap();

    let mut reply = vec![0u8; TRN_MSG_SIZE];
    timeout(IO_TMOUT, cli.read_exact(&mut reply))
        .await
        .expect("reply timed out")
        .unwrap();
    let msg = CommstMsg::deserialize(&reply).unwrap();
    assert_eq!(msg.msg_type(), Some(CommstType::Ack));
    stop.send(true).unwrap();
}

#[tokio::test]
async fn silent_peer_is_evicted_after_heartbeat_expiry() {
    let (addr, stop, stats) = spawn_commst(0.3).await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    let reply = commst_request(&mut cli, &CommstMsg::of_type(CommstType::Ping)).await;
    assert_eq!(reply.msg_type(), Some(CommstType::Ack));
    assert_eq!(stats.snapshot().cli_dis, 0);

    // go silent past the timeout; the server drops the peer, which
    // closes the connection from our side of the socket
    let mut buf = [0u8; 16];
    let n = timeout(IO_TMOUT, cli.read(&mut buf))
        .await
        .expect("expected server close")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(stats.snapshot().cli_dis, 1);
    stop.send(true).unwrap();
}

#[tokio::test]
async fn trnmsg_ping_and_resync() {
    let (addr, stop, _stats) = spawn_trnmsg().await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    // garbage ahead of a valid frame exercises the sync scan
    let mut wire = vec![0xFFu8, 0x00, 0x7E];
    wire.extend_from_slice(&TrnMsg::with_param(TrnMsgId::Ping, 1).serialize());
    cli.write_all(&wire).await.unwrap();

    let mut hdr = [0u8; TRNMSG_HDR_LEN];
    timeout(IO_TMOUT, cli.read_exact(&mut hdr))
        .await
        .expect("reply timed out")
        .unwrap();
    let mut len = [0u8; 4];
    len.copy_from_slice(&hdr[8..12]);
    let data_len = u32::from_ne_bytes(len) as usize;
    let mut rest = vec![0u8; data_len];
    cli.read_exact(&mut rest).await.unwrap();
    let mut frame = hdr.to_vec();
    frame.extend_from_slice(&rest);

    let reply = TrnMsg::deserialize(&frame).unwrap();
    assert_eq!(reply.id(), Some(TrnMsgId::Ack));
    assert_eq!(reply.param(), Some(0xabcd));
    stop.send(true).unwrap();
}

#[tokio::test]
async fn trnmsg_meas_dispatch_round_trip() {
    let (addr, stop, _stats) = spawn_trnmsg().await;
    let mut cli = TcpStream::connect(addr).await.unwrap();

    let meas = Measurement {
        time: 777.0,
        data_type: 2,
        ping_number: 31,
        beams: vec![
            MeasBeam {
                beam_num: 0,
                range: 80.0,
                cross: 2.0,
                along: 0.0,
                altitude: 79.9,
            },
            MeasBeam {
                beam_num: 1,
                range: 0.0,
                cross: 0.0,
                along: 0.0,
                altitude: 5.0,
            },
        ],
    };
    let mut data = 7i32.to_ne_bytes().to_vec();
    meas.write_to(&mut data);
    let req = TrnMsg::new(TrnMsgId::Meas, data);
    cli.write_all(&req.serialize()).await.unwrap();

    let mut hdr = [0u8; TRNMSG_HDR_LEN];
    timeout(IO_TMOUT, cli.read_exact(&mut hdr))
        .await
        .expect("reply timed out")
        .unwrap();
    let mut len = [0u8; 4];
    len.copy_from_slice(&hdr[8..12]);
    let mut rest = vec![0u8; u32::from_ne_bytes(len) as usize];
    cli.read_exact(&mut rest).await.unwrap();
    let mut frame = hdr.to_vec();
    frame.extend_from_slice(&rest);

    // deserialize validates the reply checksum over its payload
    let reply = TrnMsg::deserialize(&frame).unwrap();
    assert_eq!(reply.id(), Some(TrnMsgId::Meas));
    let (echoed, _) = Measurement::read_from(&reply.data[4..]).unwrap();
    assert_eq!(echoed.ping_number, 31);
    assert_eq!(echoed.beams.len(), 2);
    // the filter zeroed the altitude of the no-return beam
    assert_eq!(echoed.beams[1].altitude, 0.0);
    stop.send(true).unwrap();
}

#[tokio::test]
async fn publish_reaches_every_live_peer_in_order() {
    let (stop, rx) = watch::channel(false);
    let (feed, feed_rx) = mpsc::channel(8);
    let proto = TrnmsgProtocol::new(BenchFilter::new());
    let mut port = Port::new(
        settings("pub", PortMode::Publish, 0.0),
        SessionLog::null(),
        proto,
        rx,
    )
    .with_input(feed_rx);
    port.connect().await.unwrap();
    let addr = port.local_addr().unwrap();
    let stats = port.stats();
    tokio::spawn(port.run());

    let mut cli_a = TcpStream::connect(addr).await.unwrap();
    let mut cli_b = TcpStream::connect(addr).await.unwrap();
    // let the accept loop admit both peers
    sleep(Duration::from_millis(100)).await;

    let record = TrnMsg::with_param(TrnMsgId::Ack, 42).serialize();
    feed.send(bytes::Bytes::from(record.clone())).await.unwrap();

    for cli in [&mut cli_a, &mut cli_b] {
        let mut got = vec![0u8; record.len()];
        timeout(IO_TMOUT, cli.read_exact(&mut got))
            .await
            .expect("publish timed out")
            .unwrap();
        assert_eq!(got, record);
    }
    let snap = stats.snapshot();
    assert_eq!(snap.pub_n, 2);
    assert_eq!(snap.pub_bytes, 2 * record.len() as u64);
    stop.send(true).unwrap();
}
