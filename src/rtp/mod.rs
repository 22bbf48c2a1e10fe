//! RTP/SRTP transport: packet framing, SDP parsing, SRTP protection, and
//! the UDP send/receive sessions the pipeline workers drive.

mod packet;
mod sdp;
mod session;
mod srtp;

pub use packet::{is_rtcp, parse_sender_report, RtpHeader, RtpPacket, SenderReport, RTP_VERSION};
pub use sdp::SessionDescription;
pub use session::{ReceiverStats, RtpEvent, RtpReceiver, RtpSender};
pub use srtp::{CryptoSuite, SrtpContext, SRTP_MASTER_KEY_LEN, SRTP_MASTER_SALT_LEN};
