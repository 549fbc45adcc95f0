#![forbid(unsafe_code)]

//! Protocol implementations plugged into ports.
//!
//! Each protocol owns its TRN resource and maps decoded requests to
//! filter operations. Replies on TCP go out over the peer's stream;
//! plain-text UDP replies go back through the port socket. A send that
//! fails with a broken pipe propagates `Epipe`, which the port loop
//! turns into an eviction.

use bytes::BytesMut;
use tracing::debug;

use crate::error::MsgErr;
use crate::net::peer::Peer;
use crate::net::port::{PortCtx, PortProtocol};
use crate::proto::commst::{self, CommstMsg, CommstOptions, CommstType};
use crate::proto::text;
use crate::proto::trnmsg::{self, TrnMsg, TrnMsgId};
use crate::trn::{Measurement, PoseEstimate, TrnFilter};

fn etime() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Framed trnmsg request/response protocol (TCP).
pub struct TrnmsgProtocol<T: TrnFilter> {
    pub trn: T,
}

impl<T: TrnFilter> TrnmsgProtocol<T> {
    pub fn new(trn: T) -> Self {
        TrnmsgProtocol { trn }
    }
}

impl<T: TrnFilter> PortProtocol for TrnmsgProtocol<T> {
    async fn read(
        &mut self,
        _ctx: &PortCtx,
        peer: &mut Peer,
    ) -> Result<Option<BytesMut>, MsgErr> {
        let sock = peer.sock.as_ref().ok_or(MsgErr::Einval)?;
        match trnmsg::read_msg(sock) {
            Ok(frame) => Ok(Some(frame)),
            Err(MsgErr::Enodata) => Ok(None),
            Err(kind) => Err(kind),
        }
    }

    async fn handle(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        msg: &[u8],
    ) -> Result<usize, MsgErr> {
        let msg_in = match TrnMsg::deserialize(msg) {
            Ok(m) => m,
            Err(kind) => {
                ctx.stats.proto_handle_error();
                return Err(kind);
            }
        };

        let msg_out = match msg_in.id() {
            Some(TrnMsgId::Ping) => {
                debug!(peer = %peer.addr, "trnmsg ping");
                ctx.log_event(&format!(
                    "trn_ping_ack,{:.3},[{}:{}]",
                    etime(),
                    peer.chost,
                    peer.service
                ));
                Some(TrnMsg::with_param(TrnMsgId::Ack, 0xabcd))
            }
            Some(TrnMsgId::Meas) => {
                // data = [parameter i32][serialized measurement]
                if msg_in.data.len() < 4 {
                    ctx.stats.proto_handle_error();
                    return Err(MsgErr::Eparse);
                }
                let mut p = [0u8; 4];
                p.copy_from_slice(&msg_in.data[..4]);
                let parameter = i32::from_ne_bytes(p);
                let Some((mut meas, _)) = Measurement::read_from(&msg_in.data[4..]) else {
                    ctx.stats.proto_handle_error();
                    return Err(MsgErr::Eparse);
                };
                self.trn.meas_update(&mut meas, parameter);
                ctx.log_event(&format!(
                    "trn_meas,{:.3},[{}:{}]",
                    etime(),
                    peer.chost,
                    peer.service
                ));
                let mut data = parameter.to_ne_bytes().to_vec();
                meas.write_to(&mut data);
                Some(TrnMsg::new(TrnMsgId::Meas, data))
            }
            _ => {
                debug!(peer = %peer.addr, msg_id = msg_in.msg_id, "unknown trnmsg");
                ctx.stats.proto_handle_error();
                None
            }
        };

        match msg_out {
            Some(reply) => peer.send(&reply.serialize()).await,
            None => Ok(0),
        }
    }

    async fn publish(
        &mut self,
        _ctx: &PortCtx,
        peer: &mut Peer,
        data: &[u8],
    ) -> Result<usize, MsgErr> {
        peer.send(data).await
    }
}

/// Legacy commsT request/response protocol (TCP).
pub struct CommstProtocol<T: TrnFilter> {
    pub trn: T,
    pub opts: CommstOptions,
}

impl<T: TrnFilter> CommstProtocol<T> {
    pub fn new(trn: T, opts: CommstOptions) -> Self {
        CommstProtocol { trn, opts }
    }
}

impl<T: TrnFilter> CommstProtocol<T> {
    fn dispatch(&mut self, ctx: &PortCtx, peer: &Peer, mut ct: CommstMsg) -> Option<CommstMsg> {
        let trn = &mut self.trn;
        let now = etime();
        let who = format!("[{}:{}]", peer.chost, peer.service);
        let ack = |p: i32| Some(CommstMsg::ptype(CommstType::Ack, p));

        match ct.msg_type() {
            Some(CommstType::Init) => {
                trn.initialize(&ct.meas);
                if trn.initialized() {
                    ctx.log_event(&format!("trn_init_ack,{who}"));
                    Some(CommstMsg::of_type(CommstType::Ack))
                } else {
                    ctx.log_event(&format!("trn_init_nack,{who}"));
                    Some(CommstMsg::of_type(CommstType::Nack))
                }
            }
            Some(CommstType::Meas) => {
                let parameter = ct.parameter;
                trn.meas_update(&mut ct.meas, parameter);
                ctx.log_event(&format!("trn_meas,{now},{who}"));
                Some(ct)
            }
            Some(CommstType::Motn) => {
                trn.motion_update(&ct.est);
                ctx.log_event(&format!("trn_motn,{now},{who}"));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::Mle) => {
                ct.est = trn.estimate_pose(PoseEstimate::Mle);
                ctx.log_event(&format!("trn_mle,{now},{who}"));
                Some(ct)
            }
            Some(CommstType::Mmse) => {
                ct.est = trn.estimate_pose(PoseEstimate::Mmse);
                ctx.log_event(&format!("trn_mmse,{now},{who}"));
                Some(ct)
            }
            Some(CommstType::LastMeas) => {
                let p = i32::from(trn.last_meas_successful());
                ctx.log_event(&format!("trn_lms,{now},{p},{who}"));
                ack(p)
            }
            Some(CommstType::NReinits) => {
                ctx.log_event(&format!("trn_n_reinits,{now},{who}"));
                ack(trn.num_reinits())
            }
            Some(CommstType::FiltType) => {
                ctx.log_event(&format!("trn_ftype,{now},{who}"));
                ack(trn.filter_type())
            }
            Some(CommstType::FiltState) => {
                ctx.log_event(&format!("trn_fstate,{now},{who}"));
                ack(trn.filter_state())
            }
            Some(CommstType::OutMeas) => {
                let p = i32::from(trn.outstanding_meas());
                ctx.log_event(&format!("trn_out_meas,{now},{p},{who}"));
                ack(p)
            }
            Some(CommstType::IsConv) => {
                let p = i32::from(trn.is_converged());
                ctx.log_event(&format!("trn_is_conv,{now},{p},{who}"));
                ack(p)
            }
            Some(CommstType::IsInit) => {
                let p = i32::from(trn.initialized());
                ctx.log_event(&format!("trn_is_init,{now},{p},{who}"));
                ack(p)
            }
            Some(CommstType::FiltReinit) => {
                trn.reinit_filter(true);
                ctx.log_event(&format!("trn_filt_reinit,{now},{who}"));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::SetMw) => {
                trn.set_modified_weighting(ct.parameter);
                ctx.log_event(&format!("trn_set_mw,{now},{},{who}", ct.parameter));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::SetFr) => {
                trn.set_filter_reinit(ct.parameter != 0);
                ctx.log_event(&format!("trn_set_fr,{now},{},{who}", ct.parameter));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::SetIma) => {
                trn.set_interp_meas_attitude(ct.parameter != 0);
                ctx.log_event(&format!("trn_set_ima,{now},{},{who}", ct.parameter));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::SetMim) => {
                trn.set_map_interp_method(ct.parameter);
                ctx.log_event(&format!("trn_set_mim,{now},{},{who}", ct.parameter));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::SetVdr) => {
                trn.set_vehicle_drift_rate(ct.vdr);
                ctx.log_event(&format!("trn_set_vdr,{now},{},{who}", ct.vdr));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::FiltGrd) => {
                if ct.parameter == 0 {
                    trn.use_highgrade_filter();
                } else {
                    trn.use_lowgrade_filter();
                }
                ctx.log_event(&format!("trn_set_filtgrd,{now},{},{who}", ct.parameter));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::Ping) => {
                ctx.log_event(&format!("trn_ping_ack,{now},{who}"));
                Some(CommstMsg::of_type(CommstType::Ack))
            }
            Some(CommstType::Ack) | Some(CommstType::Nack) | None => {
                debug!(code = ct.msg_type, "unsupported commst message");
                ctx.stats.proto_handle_error();
                Some(CommstMsg::of_type(CommstType::Nack))
            }
        }
    }
}

impl<T: TrnFilter> PortProtocol for CommstProtocol<T> {
    async fn read(
        &mut self,
        _ctx: &PortCtx,
        peer: &mut Peer,
    ) -> Result<Option<BytesMut>, MsgErr> {
        let sock = peer.sock.as_ref().ok_or(MsgErr::Einval)?;
        commst::read_msg(sock, &self.opts).await
    }

    async fn handle(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        msg: &[u8],
    ) -> Result<usize, MsgErr> {
        let ct = match CommstMsg::deserialize(msg) {
            Ok(ct) => ct,
            Err(kind) => {
                // truncated or garbled blob; answer NACK
                debug!(len = msg.len(), ?kind, "commst decode failed");
                ctx.stats.proto_handle_error();
                let nack = CommstMsg::of_type(CommstType::Nack).serialize(self.opts.msg_size)?;
                return peer.send(&nack).await;
            }
        };
        match self.dispatch(ctx, peer, ct) {
            Some(reply) => {
                let blob = reply.serialize(self.opts.msg_size)?;
                peer.send(&blob).await
            }
            None => Ok(0),
        }
    }

    async fn publish(
        &mut self,
        _ctx: &PortCtx,
        peer: &mut Peer,
        data: &[u8],
    ) -> Result<usize, MsgErr> {
        peer.send(data).await
    }
}

/// Plain-text control protocol for MB1 publish ports (UDP).
///
/// Subscribers announce themselves with `CON`/`REQ`; records are fanned
/// out to every live peer via the port socket.
#[derive(Debug, Default)]
pub struct MbTextProtocol;

impl PortProtocol for MbTextProtocol {
    async fn read(
        &mut self,
        _ctx: &PortCtx,
        _peer: &mut Peer,
    ) -> Result<Option<BytesMut>, MsgErr> {
        // inbound datagrams are delivered by the discovery path
        Ok(None)
    }

    async fn handle(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        msg: &[u8],
    ) -> Result<usize, MsgErr> {
        let tok = text::token(msg);
        let reply = match tok {
            text::TOK_CON | text::TOK_REQ => text::message(text::TOK_ACK, &[]),
            _ => text::message(text::TOK_NACK, &[]),
        };
        ctx.log_event(&format!(
            "[MB.{}]:{} id[{}:{}]",
            ctx.name,
            if tok.is_empty() { "?" } else { tok },
            peer.chost,
            peer.service
        ));
        ctx.send_udp(peer.addr, &reply).await
    }

    async fn publish(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        data: &[u8],
    ) -> Result<usize, MsgErr> {
        ctx.send_udp(peer.addr, data).await
    }
}

/// Plain-text control protocol for TRN update ports (UDP), with a
/// reset hook invoked on `RST`.
#[derive(Default)]
pub struct TrnuTextProtocol {
    reset: Option<Box<dyn FnMut() -> i32 + Send>>,
}

impl TrnuTextProtocol {
    pub fn new() -> Self {
        TrnuTextProtocol::default()
    }

    pub fn with_reset(mut self, cb: impl FnMut() -> i32 + Send + 'static) -> Self {
        self.reset = Some(Box::new(cb));
        self
    }
}

impl PortProtocol for TrnuTextProtocol {
    async fn read(
        &mut self,
        _ctx: &PortCtx,
        _peer: &mut Peer,
    ) -> Result<Option<BytesMut>, MsgErr> {
        Ok(None)
    }

    async fn handle(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        msg: &[u8],
    ) -> Result<usize, MsgErr> {
        let tok = text::token(msg);
        let who = format!("[{}:{}]", peer.chost, peer.service);
        let reply = match tok {
            text::TOK_CON | text::TOK_REQ | text::TOK_HBT | text::TOK_DIS | text::TOK_PING => {
                ctx.log_event(&format!("trnu_{},{who}", tok.to_ascii_lowercase()));
                text::message(text::TOK_ACK, &[])
            }
            text::TOK_RST => match self.reset.as_mut() {
                Some(cb) => {
                    let status = cb();
                    ctx.log_event(&format!("trn_filt_reinit,{:.3},{who},{status}", etime()));
                    if status == 0 {
                        text::message(text::TOK_ACK, &[])
                    } else {
                        text::message(text::TOK_NACK, &[])
                    }
                }
                None => {
                    ctx.log_event(&format!("trn_filt_reinit,{:.3},{who},-1", etime()));
                    text::message(text::TOK_NACK, &[])
                }
            },
            _ => text::message(text::TOK_NACK, &[]),
        };
        ctx.send_udp(peer.addr, &reply).await
    }

    async fn publish(
        &mut self,
        ctx: &PortCtx,
        peer: &mut Peer,
        data: &[u8],
    ) -> Result<usize, MsgErr> {
        ctx.send_udp(peer.addr, data).await
    }
}
