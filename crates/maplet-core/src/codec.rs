//! Length-prefixed msgpack frame codec for the parent/child pipe.
//!
//! Every message is encoded as `len(u32, big-endian) || msgpack body`. The
//! framing minimizes copies and keeps streamed responses larger than memory
//! possible: a single engine request may produce many `Chunk` frames before
//! its terminal `End`.
//!
//! The codec is direction-agnostic: [`CommandCodec`] is the parent side
//! (encodes [`Command`], decodes [`Reply`]), [`ReplyCodec`] is the child
//! side. Oversized frames fail with [`Error::FrameTooLarge`]; a stream that
//! ends in the middle of a frame fails with [`Error::TruncatedFrame`].

use std::io::Cursor;
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::frames::{Command, Reply};

/// Default frame size limit: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Frame codec over a bidirectional byte stream.
///
/// `Tx` is the frame type written by this side, `Rx` the frame type read
/// from the peer.
#[derive(Debug)]
pub struct FrameCodec<Tx, Rx> {
    max_frame_size: usize,
    _marker: PhantomData<fn(Tx) -> Rx>,
}

/// Parent side: sends commands, receives replies.
pub type CommandCodec = FrameCodec<Command, Reply>;

/// Child side: sends replies, receives commands.
pub type ReplyCodec = FrameCodec<Reply, Command>;

impl<Tx, Rx> Default for FrameCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl<Tx, Rx> FrameCodec<Tx, Rx> {
    pub const fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            _marker: PhantomData,
        }
    }

    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for FrameCodec<Tx, Rx> {
    type Error = Error;

    fn encode(&mut self, frame: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Reserve the length prefix, serialize in place, then patch it.
        let start = dst.len();
        dst.put_u32(0);
        let mut writer = dst.writer();
        rmp_serde::encode::write_named(&mut writer, &frame)?;
        let dst = writer.into_inner();

        let size = dst.len() - start - LEN_PREFIX;
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        dst[start..start + LEN_PREFIX].copy_from_slice(&(size as u32).to_be_bytes());
        Ok(())
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for FrameCodec<Tx, Rx> {
    type Item = Rx;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let size = u32::from_be_bytes(len_bytes) as usize;

        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        if src.len() < LEN_PREFIX + size {
            // Reserve upfront so the transport can read the whole body
            // without reallocating.
            src.reserve(LEN_PREFIX + size - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let body = src.split_to(size);
        let frame = rmp_serde::from_read(Cursor::new(&body[..]))?;
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(Error::TruncatedFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{CheckoutStatus, Reply};
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn encode_prepends_big_endian_length() {
        let mut codec = CommandCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Command::Ping { echo: "abc".into() }, &mut buf)
            .unwrap();

        let size = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(size, buf.len() - 4);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut tx = ReplyCodec::default();
        let mut buf = BytesMut::new();
        tx.encode(Reply::Pong { echo: "abc".into() }, &mut buf)
            .unwrap();

        let mut rx = CommandCodec::default();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(rx.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&buf[buf.len() - 1..]);
        match rx.decode(&mut partial).unwrap() {
            Some(Reply::Pong { echo }) => assert_eq!(echo, "abc"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut tx = ReplyCodec::new(64);
        let mut buf = BytesMut::new();
        let err = tx
            .encode(
                Reply::Chunk {
                    id: 1,
                    data: vec![0u8; 1024],
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));

        // An adversarial length prefix is rejected before buffering.
        let mut rx = FrameCodec::<Command, Reply>::new(64);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let err = rx.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut tx = ReplyCodec::default();
        let mut buf = BytesMut::new();
        tx.encode(Reply::end(), &mut buf).unwrap();

        let mut rx = CommandCodec::default();
        let mut truncated = BytesMut::from(&buf[..buf.len() - 1]);
        let err = rx.decode_eof(&mut truncated).unwrap_err();
        assert!(matches!(err, Error::TruncatedFrame));
    }

    #[tokio::test]
    async fn framed_duplex_roundtrip() {
        let (parent_io, child_io) = tokio::io::duplex(4096);

        let mut parent = FramedWrite::new(parent_io, CommandCodec::default());
        let mut child = FramedRead::new(child_io, ReplyCodec::default());

        parent
            .send(Command::Checkout {
                uri: "/france/parcels".into(),
                pull: true,
            })
            .await
            .unwrap();

        match child.next().await.unwrap().unwrap() {
            Command::Checkout { uri, pull } => {
                assert_eq!(uri, "/france/parcels");
                assert!(pull);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Exercise the reverse direction over the same pair.
        let child_io = child.into_inner();
        let parent_io = parent.into_inner();
        let mut child = FramedWrite::new(child_io, ReplyCodec::default());
        let mut parent = FramedRead::new(parent_io, CommandCodec::default());

        child
            .send(Reply::Info(crate::frames::CacheInfo::not_cached(
                "/france/parcels",
                CheckoutStatus::New,
            )))
            .await
            .unwrap();
        child.send(Reply::end()).await.unwrap();

        assert!(matches!(
            parent.next().await.unwrap().unwrap(),
            Reply::Info(_)
        ));
        assert!(matches!(
            parent.next().await.unwrap().unwrap(),
            Reply::End { ok: true, .. }
        ));
    }
}
