// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The shared request/response ring.
//!
//! One page holds a small control header and a power-of-two array of
//! fixed-size slots. The front places requests at `req_prod` and consumes
//! responses at `rsp_cons`; the back consumes requests and places responses.
//! Producer cursors are free-running 32-bit counters masked into the slot
//! array, and each side publishes an event threshold (`req_event`,
//! `rsp_event`) that tells the producer when a notification is wanted,
//! using the standard signed wrap comparison.
//!
//! [`Front`] is the driver's half. [`Back`] is the peer's half, kept here
//! for the simulated back-end and for tests.

use crate::mm::Page;
use crate::mm::PAGE_SIZE;
use std::sync::atomic::Ordering;

const REQ_PROD: usize = 0;
const REQ_EVENT: usize = 4;
const RSP_PROD: usize = 8;
const RSP_EVENT: usize = 12;

/// Bytes reserved for the control header at the start of the ring page.
pub const RING_HEADER_SIZE: usize = 64;

/// The largest slot size of either direction, used to size slot buffers.
pub const MAX_SLOT_SIZE: usize = 12;

/// Returns the slot count for a ring with the given slot size: the largest
/// power of two that fits after the control header.
pub fn ring_size(slot_size: usize) -> u32 {
    let slots = (PAGE_SIZE - RING_HEADER_SIZE) / slot_size;
    let mut size = 1u32;
    while (size as usize) * 2 <= slots {
        size *= 2;
    }
    size
}

/// The front (request-producing) half of a shared ring.
pub struct Front {
    mem: Page,
    slot_size: usize,
    size: u32,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl Front {
    /// Initializes the control header of a freshly allocated ring page and
    /// returns the front half over it.
    pub fn new(mem: Page, slot_size: usize) -> Self {
        assert!(slot_size <= MAX_SLOT_SIZE);
        mem.store(REQ_PROD, 0, Ordering::Relaxed);
        mem.store(RSP_PROD, 0, Ordering::Relaxed);
        // Both sides start out asking to be notified about the first entry
        // the other produces.
        mem.store(REQ_EVENT, 1, Ordering::Relaxed);
        mem.store(RSP_EVENT, 1, Ordering::Release);
        Self {
            size: ring_size(slot_size),
            mem,
            slot_size,
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    /// The number of slots in each direction.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The number of requests that can be placed before the ring is full.
    pub fn free_requests(&self) -> u32 {
        self.size - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Advances the private producer cursor, returning the slot cursor to
    /// write the next request at.
    pub fn next_req_id(&mut self) -> u32 {
        let id = self.req_prod_pvt;
        self.req_prod_pvt = id.wrapping_add(1);
        id
    }

    fn slot_offset(&self, cursor: u32) -> usize {
        RING_HEADER_SIZE + (cursor & (self.size - 1)) as usize * self.slot_size
    }

    /// Writes a request record into the slot for `cursor`.
    pub fn write_slot(&self, cursor: u32, data: &[u8]) {
        debug_assert!(data.len() <= self.slot_size);
        self.mem.write_at(self.slot_offset(cursor), data);
    }

    /// Reads the slot for `cursor` into `data`.
    pub fn read_slot(&self, cursor: u32, data: &mut [u8]) {
        debug_assert!(data.len() <= self.slot_size);
        self.mem.read_at(self.slot_offset(cursor), data);
    }

    /// Publishes all privately produced requests to the peer and reports
    /// whether it asked to be notified about any of them.
    pub fn push_requests_and_check_notify(&mut self) -> bool {
        let old = self.mem.load(REQ_PROD, Ordering::Relaxed);
        let new = self.req_prod_pvt;
        // The store publishes the slot contents; the SeqCst pair orders it
        // against the event threshold read below.
        self.mem.store(REQ_PROD, new, Ordering::SeqCst);
        let event = self.mem.load(REQ_EVENT, Ordering::SeqCst);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// Returns true if the peer has published responses not yet consumed.
    pub fn has_unconsumed_responses(&self) -> bool {
        self.mem.load(RSP_PROD, Ordering::Acquire) != self.rsp_cons
    }

    /// Invokes `f` with each unread response slot and advances the consumer
    /// cursor, then re-arms the response event threshold. Re-checks after
    /// arming so a response racing with the threshold store is not left
    /// unconsumed without a pending notification.
    pub fn ack_responses(&mut self, mut f: impl FnMut(&[u8])) {
        let mut slot = [0u8; MAX_SLOT_SIZE];
        loop {
            let rsp_prod = self.mem.load(RSP_PROD, Ordering::Acquire);
            while self.rsp_cons != rsp_prod {
                self.read_slot(self.rsp_cons, &mut slot[..self.slot_size]);
                f(&slot[..self.slot_size]);
                self.rsp_cons = self.rsp_cons.wrapping_add(1);
            }
            self.mem
                .store(RSP_EVENT, self.rsp_cons.wrapping_add(1), Ordering::SeqCst);
            if self.mem.load(RSP_PROD, Ordering::SeqCst) == self.rsp_cons {
                break;
            }
        }
    }
}

/// The back (response-producing) half of a shared ring, attached over a page
/// whose header the front has already initialized.
pub struct Back {
    mem: Page,
    slot_size: usize,
    size: u32,
    rsp_prod_pvt: u32,
    req_cons: u32,
}

impl Back {
    pub fn new(mem: Page, slot_size: usize) -> Self {
        assert!(slot_size <= MAX_SLOT_SIZE);
        Self {
            size: ring_size(slot_size),
            mem,
            slot_size,
            rsp_prod_pvt: 0,
            req_cons: 0,
        }
    }

    fn slot_offset(&self, cursor: u32) -> usize {
        RING_HEADER_SIZE + (cursor & (self.size - 1)) as usize * self.slot_size
    }

    /// The number of published requests not yet consumed.
    pub fn unconsumed_requests(&self) -> u32 {
        self.mem
            .load(REQ_PROD, Ordering::Acquire)
            .wrapping_sub(self.req_cons)
    }

    /// Consumes the next request into `data`, if one is published.
    pub fn take_request(&mut self, data: &mut [u8]) -> bool {
        if self.unconsumed_requests() == 0 {
            return false;
        }
        debug_assert!(data.len() <= self.slot_size);
        self.mem.read_at(self.slot_offset(self.req_cons), data);
        self.req_cons = self.req_cons.wrapping_add(1);
        true
    }

    /// Places a response in the next private producer slot.
    pub fn push_response(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.slot_size);
        self.mem.write_at(self.slot_offset(self.rsp_prod_pvt), data);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
    }

    /// Publishes all privately produced responses and reports whether the
    /// front asked to be notified about any of them.
    pub fn push_responses_and_check_notify(&mut self) -> bool {
        let old = self.mem.load(RSP_PROD, Ordering::Relaxed);
        let new = self.rsp_prod_pvt;
        self.mem.store(RSP_PROD, new, Ordering::SeqCst);
        let event = self.mem.load(RSP_EVENT, Ordering::SeqCst);
        new.wrapping_sub(event) < new.wrapping_sub(old)
    }

    /// Re-arms the request event threshold and reports whether requests
    /// arrived while it was being armed.
    pub fn final_check_for_requests(&mut self) -> bool {
        self.mem
            .store(REQ_EVENT, self.req_cons.wrapping_add(1), Ordering::SeqCst);
        self.mem.load(REQ_PROD, Ordering::SeqCst) != self.req_cons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RX_SLOT_SIZE;
    use crate::protocol::TX_SLOT_SIZE;

    fn pair(slot_size: usize) -> (Front, Back) {
        let page = Page::new_zeroed();
        let front = Front::new(page.clone(), slot_size);
        let back = Back::new(page, slot_size);
        (front, back)
    }

    #[test]
    fn both_directions_have_256_slots() {
        assert_eq!(ring_size(RX_SLOT_SIZE), 256);
        assert_eq!(ring_size(TX_SLOT_SIZE), 256);
    }

    #[test]
    fn headroom_accounting() {
        let (mut front, mut back) = pair(RX_SLOT_SIZE);
        assert_eq!(front.free_requests(), 256);
        for _ in 0..256 {
            let cursor = front.next_req_id();
            front.write_slot(cursor, &[0u8; RX_SLOT_SIZE]);
        }
        assert_eq!(front.free_requests(), 0);
        assert!(front.push_requests_and_check_notify());

        // Consuming requests alone does not create headroom; responses do.
        let mut slot = [0u8; RX_SLOT_SIZE];
        while back.take_request(&mut slot) {
            back.push_response(&slot);
        }
        assert_eq!(front.free_requests(), 0);
        back.push_responses_and_check_notify();
        front.ack_responses(|_| ());
        assert_eq!(front.free_requests(), 256);
    }

    #[test]
    fn requests_invisible_until_pushed() {
        let (mut front, mut back) = pair(TX_SLOT_SIZE);
        let cursor = front.next_req_id();
        front.write_slot(cursor, &[1u8; TX_SLOT_SIZE]);
        assert_eq!(back.unconsumed_requests(), 0);
        assert!(!back.take_request(&mut [0u8; TX_SLOT_SIZE]));
        front.push_requests_and_check_notify();
        assert_eq!(back.unconsumed_requests(), 1);
        let mut slot = [0u8; TX_SLOT_SIZE];
        assert!(back.take_request(&mut slot));
        assert_eq!(slot, [1u8; TX_SLOT_SIZE]);
    }

    #[test]
    fn notify_only_when_crossing_event_threshold() {
        let (mut front, mut back) = pair(TX_SLOT_SIZE);

        // The initial threshold asks for the first request.
        for _ in 0..3 {
            let cursor = front.next_req_id();
            front.write_slot(cursor, &[0u8; TX_SLOT_SIZE]);
        }
        assert!(front.push_requests_and_check_notify());

        // The threshold has not been re-armed, so a further push stays
        // silent.
        let cursor = front.next_req_id();
        front.write_slot(cursor, &[0u8; TX_SLOT_SIZE]);
        assert!(!front.push_requests_and_check_notify());

        // Once the back consumes and re-arms, the next push notifies again.
        let mut slot = [0u8; TX_SLOT_SIZE];
        while back.take_request(&mut slot) {}
        assert!(!back.final_check_for_requests());
        let cursor = front.next_req_id();
        front.write_slot(cursor, &[0u8; TX_SLOT_SIZE]);
        assert!(front.push_requests_and_check_notify());
    }

    #[test]
    fn final_check_catches_racing_requests() {
        let (mut front, mut back) = pair(TX_SLOT_SIZE);
        let cursor = front.next_req_id();
        front.write_slot(cursor, &[0u8; TX_SLOT_SIZE]);
        front.push_requests_and_check_notify();
        // A request arrived before the threshold was re-armed; the back must
        // notice instead of going to sleep.
        assert!(back.final_check_for_requests());
    }

    #[test]
    fn ack_responses_consumes_in_order_and_rearms() {
        let (mut front, mut back) = pair(RX_SLOT_SIZE);
        for _ in 0..4 {
            let cursor = front.next_req_id();
            front.write_slot(cursor, &[0u8; RX_SLOT_SIZE]);
        }
        front.push_requests_and_check_notify();
        let mut slot = [0u8; RX_SLOT_SIZE];
        let mut n = 0u8;
        while back.take_request(&mut slot) {
            back.push_response(&[n; RX_SLOT_SIZE]);
            n += 1;
        }
        assert!(back.push_responses_and_check_notify());

        let mut seen = Vec::new();
        front.ack_responses(|s| seen.push(s[0]));
        assert_eq!(seen, [0, 1, 2, 3]);
        assert!(!front.has_unconsumed_responses());

        // Re-armed: the next response push wants a notification.
        back.push_response(&[9; RX_SLOT_SIZE]);
        assert!(back.push_responses_and_check_notify());
    }

    #[test]
    fn cursors_wrap_cleanly() {
        let (mut front, mut back) = pair(RX_SLOT_SIZE);
        let mut slot = [0u8; RX_SLOT_SIZE];
        // Run several full revolutions of the 256-slot ring.
        for round in 0..1024u32 {
            let cursor = front.next_req_id();
            assert_eq!(cursor, round);
            front.write_slot(cursor, &round.to_le_bytes().repeat(2));
            front.push_requests_and_check_notify();
            assert!(back.take_request(&mut slot));
            assert_eq!(slot[..4], round.to_le_bytes());
            back.push_response(&slot);
            back.push_responses_and_check_notify();
            front.ack_responses(|_| ());
            assert_eq!(front.free_requests(), 256);
        }
    }
}
