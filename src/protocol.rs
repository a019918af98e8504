// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The wire format shared with the network back-end.
//!
//! Ring slots hold fixed-size little-endian records. Requests and responses
//! for one direction share the slot array, so the slot size per direction is
//! the larger of its two record sizes: 8 bytes for receive, 12 for transmit.

pub use packed_nums::*;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type i16_le = zerocopy::I16<zerocopy::LittleEndian>;
}

use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A request posting an empty, writably granted page for the back-end to
/// fill with a received frame.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxRequest {
    pub id: u16_le,
    pub pad: u16_le,
    pub gref: u32_le,
}

/// The back-end's answer to an [`RxRequest`]. A positive `status` is the
/// frame length; a negative one is an error code.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxResponse {
    pub id: u16_le,
    pub offset: u16_le,
    pub flags: u16_le,
    pub status: i16_le,
}

/// A transmit request naming a read-only granted page holding (part of) an
/// outgoing frame.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxRequest {
    pub gref: u32_le,
    pub offset: u16_le,
    pub flags: u16_le,
    pub id: u16_le,
    pub size: u16_le,
}

/// The back-end's answer to a [`TxRequest`].
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxResponse {
    pub id: u16_le,
    pub status: i16_le,
}

/// The checksum of this frame is blank; the peer must compute it.
pub const TXF_CSUM_BLANK: u16 = 1 << 0;
/// The frame data has already been validated.
pub const TXF_DATA_VALIDATED: u16 = 1 << 1;
/// More fragments of this frame follow in subsequent requests.
pub const TXF_MORE_DATA: u16 = 1 << 2;
/// An extra-info record follows this request.
pub const TXF_EXTRA_INFO: u16 = 1 << 3;

/// The request completed successfully.
pub const RSP_OKAY: i16 = 0;
/// A reserved filler response; carries no completion.
pub const RSP_NULL: i16 = 1;
/// The peer failed to process the request.
pub const RSP_ERROR: i16 = -1;
/// The peer dropped the request.
pub const RSP_DROPPED: i16 = -2;

/// Slot size of the receive ring.
pub const RX_SLOT_SIZE: usize = size_of::<RxRequest>();
/// Slot size of the transmit ring.
pub const TX_SLOT_SIZE: usize = size_of::<TxRequest>();

const _: () = assert!(size_of::<RxRequest>() == 8);
const _: () = assert!(size_of::<RxResponse>() == 8);
const _: () = assert!(size_of::<TxRequest>() == 12);
const _: () = assert!(size_of::<TxResponse>() == 4);
const _: () = assert!(size_of::<RxResponse>() <= RX_SLOT_SIZE);
const _: () = assert!(size_of::<TxResponse>() <= TX_SLOT_SIZE);

impl RxRequest {
    pub fn new(id: u16, gref: u32) -> Self {
        Self {
            id: id.into(),
            pad: 0.into(),
            gref: gref.into(),
        }
    }
}

impl RxResponse {
    pub fn new(id: u16, offset: u16, flags: u16, status: i16) -> Self {
        Self {
            id: id.into(),
            offset: offset.into(),
            flags: flags.into(),
            status: status.into(),
        }
    }
}

impl TxRequest {
    pub fn new(gref: u32, offset: u16, flags: u16, id: u16, size: u16) -> Self {
        Self {
            gref: gref.into(),
            offset: offset.into(),
            flags: flags.into(),
            id: id.into(),
            size: size.into(),
        }
    }
}

impl TxResponse {
    pub fn new(id: u16, status: i16) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    #[test]
    fn rx_request_round_trip() {
        for (id, gref) in [(0u16, 0u32), (1, 8), (0xffff, 0xffff_ffff), (513, 0x10001)] {
            let req = RxRequest::new(id, gref);
            let (back, rest) = RxRequest::read_from_prefix(req.as_bytes()).unwrap();
            assert!(rest.is_empty());
            assert_eq!(back.id.get(), id);
            assert_eq!(back.gref.get(), gref);
        }
    }

    #[test]
    fn tx_request_round_trip() {
        let req = TxRequest::new(0xdead_beef, 64, TXF_MORE_DATA, 0xbeef, 3064);
        let (back, _) = TxRequest::read_from_prefix(req.as_bytes()).unwrap();
        assert_eq!(back.gref.get(), 0xdead_beef);
        assert_eq!(back.offset.get(), 64);
        assert_eq!(back.flags.get(), TXF_MORE_DATA);
        assert_eq!(back.id.get(), 0xbeef);
        assert_eq!(back.size.get(), 3064);
    }

    #[test]
    fn responses_round_trip_negative_status() {
        let rsp = RxResponse::new(7, 0, 0, RSP_DROPPED);
        let (back, _) = RxResponse::read_from_prefix(rsp.as_bytes()).unwrap();
        assert_eq!(back.status.get(), -2);

        let rsp = TxResponse::new(9, RSP_ERROR);
        let (back, _) = TxResponse::read_from_prefix(rsp.as_bytes()).unwrap();
        assert_eq!(back.id.get(), 9);
        assert_eq!(back.status.get(), -1);
    }

    #[test]
    fn records_are_little_endian() {
        let req = TxRequest::new(0x0102_0304, 0x0506, 0x0708, 0x090a, 0x0b0c);
        assert_eq!(
            req.as_bytes(),
            &[0x04, 0x03, 0x02, 0x01, 0x06, 0x05, 0x08, 0x07, 0x0a, 0x09, 0x0c, 0x0b]
        );
    }
}
