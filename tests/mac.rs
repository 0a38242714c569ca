//! End-to-end MAC scenarios against mock radio, rtimer and clock: idle
//! duty cycling, a phase-locked unicast transmission with wake-up
//! sequence and acknowledgment, and a full reception with in-interrupt
//! acknowledgment synthesis.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex;

use akes154::akes;
use akes154::anti_replay::OutgoingCounters;
use akes154::ccm_inputs;
use akes154::config;
use akes154::crypto::{CcmStar, SoftAes128};
use akes154::framer::{self, FramerContext};
use akes154::leaky_bucket::LeakyBucket;
use akes154::mac::Mac;
use akes154::nbr::{NbrTable, PermanentNbr, Phase};
use akes154::packetbuf::{Attr, FrameType, Packetbuf};
use akes154::radio::{Radio, RadioError};
use akes154::time::{rtimer_lt, Rtimer, RtimerClock, TooLate};
use akes154::wake_up_counter::WakeUpCounter;
use akes154::{IgnoreExhaustion, LinkAddr, PanId, TxResult};
use rand_core::RngCore;

const ADDR_A: LinkAddr = LinkAddr([0, 0, 0, 0, 0, 0, 0, 0x02]);
const ADDR_B: LinkAddr = LinkAddr([0, 0, 0, 0, 0, 0, 0, 0x01]);
const PAN: PanId = PanId(0xABCD);
const MASTER: [u8; 16] = [0x55; 16];

// --- mocks ---------------------------------------------------------------

struct ConstRng(u8);

impl RngCore for ConstRng {
    fn next_u32(&mut self) -> u32 {
        u32::from_ne_bytes([self.0; 4])
    }
    fn next_u64(&mut self) -> u64 {
        u64::from_ne_bytes([self.0; 8])
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(self.0);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        dest.fill(self.0);
        Ok(())
    }
}

#[derive(Clone)]
struct SharedTime {
    now: Rc<Cell<RtimerClock>>,
    deadline: Rc<Cell<Option<RtimerClock>>>,
}

impl SharedTime {
    fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(1000)),
            deadline: Rc::new(Cell::new(None)),
        }
    }
}

struct MockRtimer(SharedTime);

impl Rtimer for MockRtimer {
    fn now(&self) -> RtimerClock {
        self.0.now.get()
    }
    fn schedule(&mut self, at: RtimerClock) {
        self.0.deadline.set(Some(at));
    }
    fn schedule_precise(&mut self, at: RtimerClock) -> Result<(), TooLate> {
        if rtimer_lt(self.now().wrapping_add(2), at) {
            self.0.deadline.set(Some(at));
            Ok(())
        } else {
            Err(TooLate)
        }
    }
    fn cancel(&mut self) -> bool {
        self.0.deadline.take().is_some()
    }
}

struct MockClock(Rc<Cell<RtimerClock>>);

impl embedded_time::Clock for MockClock {
    type T = u32;
    const SCALING_FACTOR: embedded_time::fraction::Fraction =
        embedded_time::fraction::Fraction::new(1, 1000);

    fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
        let ms = (self.0.get() as u64 * 1000 / 32768) as u32;
        Ok(embedded_time::Instant::new(ms))
    }
}

#[derive(Default)]
struct RadioState {
    is_on: bool,
    on_count: usize,
    channel: u8,
    shr_search: bool,
    fifop_threshold: usize,
    rssi: i8,
    prepared: Vec<u8>,
    transmitted: Vec<Vec<u8>>,
    sequence: Vec<Vec<u8>>,
    sequence_finished: bool,
    rx: VecDeque<u8>,
    rx_len: usize,
}

#[derive(Clone)]
struct SharedRadio(Rc<RefCell<RadioState>>);

struct MockRadio(SharedRadio);

impl Radio for MockRadio {
    fn on(&mut self) {
        let mut s = self.0 .0.borrow_mut();
        if !s.is_on {
            s.on_count += 1;
        }
        s.is_on = true;
    }
    fn off(&mut self) {
        self.0 .0.borrow_mut().is_on = false;
    }
    fn rssi(&mut self) -> i8 {
        self.0 .0.borrow().rssi
    }
    fn channel(&self) -> u8 {
        self.0 .0.borrow().channel
    }
    fn set_channel(&mut self, channel: u8) {
        self.0 .0.borrow_mut().channel = channel;
    }
    fn set_shr_search(&mut self, enabled: bool) {
        self.0 .0.borrow_mut().shr_search = enabled;
    }
    fn set_fifop_threshold(&mut self, bytes: usize) {
        self.0 .0.borrow_mut().fifop_threshold = bytes;
    }
    fn prepare(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        self.0 .0.borrow_mut().prepared = frame.to_vec();
        Ok(())
    }
    fn reprepare(&mut self, offset: usize, bytes: &[u8]) -> Result<(), RadioError> {
        let mut s = self.0 .0.borrow_mut();
        if offset + bytes.len() > s.prepared.len() {
            return Err(RadioError::BadLength);
        }
        s.prepared[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
    fn transmit(&mut self, _enter_rx_after: bool) -> Result<(), RadioError> {
        let mut s = self.0 .0.borrow_mut();
        let frame = s.prepared.clone();
        s.transmitted.push(frame);
        Ok(())
    }
    fn prepare_sequence(&mut self, frames: &[&[u8]]) -> Result<(), RadioError> {
        let mut s = self.0 .0.borrow_mut();
        for frame in frames {
            s.sequence.push(frame.to_vec());
        }
        Ok(())
    }
    fn append_to_sequence(&mut self, frames: &[&[u8]]) -> Result<(), RadioError> {
        self.prepare_sequence(frames)
    }
    fn transmit_sequence(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
    fn finish_sequence(&mut self) -> Result<(), RadioError> {
        self.0 .0.borrow_mut().sequence_finished = true;
        Ok(())
    }
    fn read_phy_header(&mut self) -> Result<usize, RadioError> {
        Ok(self.0 .0.borrow().rx_len)
    }
    fn read_payload(&mut self, dst: &mut [u8]) -> Result<(), RadioError> {
        let mut s = self.0 .0.borrow_mut();
        if s.rx.len() < dst.len() {
            return Err(RadioError::BadLength);
        }
        for byte in dst.iter_mut() {
            *byte = s.rx.pop_front().unwrap();
        }
        Ok(())
    }
    fn remaining_payload_bytes(&self) -> usize {
        self.0 .0.borrow().rx.len()
    }
}

type TestMac = Mac<MockRadio, MockRtimer, MockClock, SoftAes128, ConstRng, IgnoreExhaustion>;

fn build(addr: LinkAddr, rng_byte: u8) -> (TestMac, SharedTime, SharedRadio) {
    let time = SharedTime::new();
    let radio = SharedRadio(Rc::new(RefCell::new(RadioState {
        rssi: -100,
        ..RadioState::default()
    })));
    let mac = Mac::new(
        MockRadio(radio.clone()),
        MockRtimer(time.clone()),
        MockClock(time.now.clone()),
        ConstRng(rng_byte),
        IgnoreExhaustion,
        SoftAes128::new(),
        addr,
        PAN,
        MASTER,
    );
    (mac, time, radio)
}

/// Fires the next pending rtimer deadline.
fn step(mac: &mut TestMac, time: &SharedTime) -> bool {
    let Some(at) = time.deadline.take() else {
        return false;
    };
    time.now.set(at);
    mac.on_timer();
    true
}

fn provision_peer(mac: &mut TestMac, peer: LinkAddr, group_key: [u8; 16], sync_t: RtimerClock) {
    let mut nbr = PermanentNbr::new(peer);
    nbr.pairwise_key = [0xA5; 16];
    nbr.group_key = group_key;
    nbr.sync = Phase {
        t: sync_t,
        wake_up_counter_at_t: WakeUpCounter(0),
    };
    nbr.historical_sync = nbr.sync;
    nbr.prolongation_time = u32::MAX;
    nbr.sent_authentic_hello = true;
    mac.neighbors_mut().add_permanent(nbr).unwrap();
}

// --- scenarios -----------------------------------------------------------

/// Without traffic, the radio is on for a bounded number of short CCA
/// samples per wake-up interval.
#[test]
fn idle_duty_cycling_stays_within_budget() {
    let (mut mac, time, radio) = build(ADDR_A, 0xAA);
    mac.start();

    let cycles = 5;
    let mut wake_ups = 0;
    let start_count = radio.0.borrow().on_count;
    while wake_ups < cycles {
        assert!(step(&mut mac, &time));
        // a cycle is complete once the radio is off again after its CCAs
        if !radio.0.borrow().is_on
            && radio.0.borrow().on_count >= start_count + (wake_ups + 1) * config::MAX_CCAS as usize
        {
            wake_ups += 1;
        }
    }

    let s = radio.0.borrow();
    assert!(!s.is_on);
    assert_eq!(s.on_count - start_count, cycles * config::MAX_CCAS as usize);
    assert!(s.transmitted.is_empty());
}

static SENT: Mutex<Vec<(bool, u8)>> = Mutex::new(Vec::new());

fn record_sent(_ptr: usize, result: TxResult, transmissions: u8) {
    SENT.lock()
        .unwrap()
        .push((result == TxResult::Ok, transmissions));
}

/// A pre-keyed unicast: one wake-up sequence with a counting-down
/// rendezvous field, one payload frame, one verified acknowledgment,
/// `transmissions == 1`.
#[test]
fn unicast_transmission_with_acknowledgment() {
    let (mut mac, time, radio) = build(ADDR_A, 0xAA);
    let group_key_a = mac.akes().group_key;
    provision_peer(&mut mac, ADDR_B, [0xB0; 16], 900);
    mac.start();

    // one idle cycle so the duty cycle settles
    for _ in 0..4 {
        assert!(step(&mut mac, &time));
    }

    let payload: [u8; 16] = *b"sixteen byte msg";
    let pb = mac.packetbuf_mut();
    pb.clear();
    pb.set_receiver(ADDR_B);
    pb.copy_from(&payload).unwrap();
    mac.send(record_sent, 7);

    // slot -> CCA -> sequence streaming -> finish -> acknowledgment window
    let mut guard = 0;
    while !radio.0.borrow().sequence_finished {
        assert!(step(&mut mac, &time), "transmission stalled");
        guard += 1;
        assert!(guard < 64);
    }

    {
        let s = radio.0.borrow();
        // wake-up frames count down to the payload frame
        assert!(s.sequence.len() >= 3);
        let wake_up_frames = &s.sequence[..s.sequence.len() - 1];
        let countdowns: Vec<u16> = wake_up_frames
            .iter()
            .map(|f| framer::parse_wake_up_frame(f, &ADDR_B).unwrap())
            .collect();
        for (i, value) in countdowns.iter().enumerate() {
            assert_eq!(*value as usize, wake_up_frames.len() - 1 - i);
        }
        // the payload frame ends the sequence
        let payload_frame = s.sequence.last().unwrap();
        assert_eq!(payload_frame[0], 0x07);
        assert!(payload_frame.len() >= config::MIN_FRAME_LENGTH + framer::FCS_LEN);
    }

    // craft the acknowledgment the receiver would send
    let mut tx_view = Packetbuf::new();
    tx_view.set_receiver(ADDR_B);
    tx_view.set_frame_counter(1);
    let nonce = ccm_inputs::generate_nonce(&tx_view, &ADDR_A, 0, true);
    let mut ack_nonce = nonce;
    ccm_inputs::to_acknowledgment_nonce(&mut ack_nonce);
    let mut ccm = CcmStar::new(SoftAes128::new());
    ccm.set_key(&group_key_a).unwrap();
    let mut ack = vec![0xCF, 0x05];
    let mut mic = [0u8; config::UNICAST_MIC_LEN];
    ccm.aead(&ack_nonce, &mut [], &ack.clone(), &mut mic, true)
        .unwrap();
    ack.extend_from_slice(&mic);
    let fcs = framer::FCS.checksum(&ack).to_le_bytes();
    ack.extend_from_slice(&fcs);

    {
        let mut s = radio.0.borrow_mut();
        s.rx_len = ack.len();
        s.rx = ack.iter().copied().collect();
    }
    mac.on_shr();
    assert!(step(&mut mac, &time));

    let sent = SENT.lock().unwrap();
    assert_eq!(sent.as_slice(), &[(true, 1)]);
    drop(sent);

    // the acknowledgment refreshed the phase lock
    let index = mac.neighbors().index_of_permanent(&ADDR_B).unwrap();
    let nbr = mac.neighbors().permanent(index).unwrap();
    assert_ne!(nbr.sync.t, 900);
}

static RECEIVED: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

fn record_input(_token: usize, pb: &Packetbuf) {
    RECEIVED.lock().unwrap().push(pb.dataptr().to_vec());
}

/// Receiver side: wake-up frame, rendezvous, filtered payload frame,
/// synthesized acknowledgment, upward delivery.
#[test]
fn reception_with_synthesized_acknowledgment() {
    let group_key_a = [0xC0; 16];
    let (mut mac, time, radio) = build(ADDR_B, 0xBB);
    provision_peer(&mut mac, ADDR_A, group_key_a, 500);
    mac.set_input_callback(record_input, 0);
    mac.start();

    // wake up into a busy channel
    radio.0.borrow_mut().rssi = -40;
    assert!(step(&mut mac, &time)); // wake -> first CCA armed
    assert!(step(&mut mac, &time)); // CCA sees energy -> hunting the SHR

    // the last wake-up frame of a sequence arrives
    let mut wuf = [0u8; framer::WAKE_UP_FRAME_LEN];
    framer::create_wake_up_frame(&mut wuf, &ADDR_B);
    framer::update_rendezvous_time(&mut wuf, 0);
    {
        let mut s = radio.0.borrow_mut();
        s.rx_len = framer::WAKE_UP_FRAME_LEN;
        s.rx = wuf.iter().copied().collect();
    }
    mac.on_shr();
    mac.on_fifop();

    // build the sealed payload frame A would send
    let payload: [u8; 16] = *b"sixteen byte msg";
    let mut pb = Packetbuf::new();
    pb.set_receiver(ADDR_B);
    pb.set_sender(ADDR_A);
    pb.set_frame_type(FrameType::Data);
    pb.copy_from(&payload).unwrap();
    let mut counters = OutgoingCounters::default();
    akes154::anti_replay::set_counter(&mut pb, &mut counters, None, &mut IgnoreExhaustion);
    let mut sender_ccm = CcmStar::new(SoftAes128::new());
    let mut sender_nbrs = NbrTable::new();
    let mut hello_bucket = LeakyBucket::new(20, 15_000);
    let mut helloack_bucket = LeakyBucket::new(20, 15_000);
    let mut ctx = FramerContext {
        ccm: &mut sender_ccm,
        nbrs: &mut sender_nbrs,
        node_addr: ADDR_A,
        pan_id: PAN,
        group_key: group_key_a,
        hello_bucket: &mut hello_bucket,
        helloack_bucket: &mut helloack_bucket,
        now_ms: 0,
    };
    framer::create(&mut pb, &mut ctx).unwrap();
    pb.set_attr(Attr::UnencryptedBytes, 0);
    akes::secure(
        &mut pb,
        &mut sender_ccm,
        &group_key_a,
        &ADDR_A,
        0,
        config::UNICAST_SEC_LVL,
    )
    .unwrap();
    let mut frame = pb.hdrptr().to_vec();
    let fcs = framer::FCS.checksum(&frame).to_le_bytes();
    frame.extend_from_slice(&fcs);

    {
        let mut s = radio.0.borrow_mut();
        s.rx_len = frame.len();
        s.rx = frame.iter().copied().collect();
    }
    mac.on_shr(); // payload SHR at the rendezvous
    mac.on_fifop(); // prefix filtered, acknowledgment prepared
    {
        let s = radio.0.borrow();
        assert!(!s.prepared.is_empty(), "no acknowledgment was prepared");
        assert_eq!(s.prepared[0], 0xCF);
    }
    mac.on_fifop(); // full frame: acknowledgment goes out
    {
        let s = radio.0.borrow();
        assert_eq!(s.transmitted.len(), 1, "acknowledgment was not sent");
    }
    mac.on_txdone();

    // delivered upward
    let received = RECEIVED.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(&received[0][..payload.len()], &payload);
    drop(received);

    // and the acknowledgment verifies on the sender side
    let ack_on_air = radio.0.borrow().transmitted[0].clone();
    let body_len = ack_on_air.len() - framer::FCS_LEN;
    let mut tx_view = Packetbuf::new();
    tx_view.set_receiver(ADDR_B);
    tx_view.set_frame_counter(1);
    let nonce = ccm_inputs::generate_nonce(&tx_view, &ADDR_A, 0, true);
    let delta = framer::parse_acknowledgment(
        &ack_on_air[..body_len],
        framer::DEFAULT_ACKNOWLEDGMENT_LEN,
        &nonce,
        &group_key_a,
        &mut sender_ccm,
    )
    .unwrap();
    let _ = delta; // the echoed wake-up delta, used for phase locking
}

/// Rejected frames must not produce an acknowledgment: a frame sealed
/// with the wrong key is dropped mid-air.
#[test]
fn inauthentic_frames_get_no_acknowledgment() {
    let group_key_a = [0xC0; 16];
    let (mut mac, time, radio) = build(ADDR_B, 0xBB);
    provision_peer(&mut mac, ADDR_A, group_key_a, 500);
    mac.start();

    radio.0.borrow_mut().rssi = -40;
    assert!(step(&mut mac, &time));
    assert!(step(&mut mac, &time));

    let mut wuf = [0u8; framer::WAKE_UP_FRAME_LEN];
    framer::create_wake_up_frame(&mut wuf, &ADDR_B);
    framer::update_rendezvous_time(&mut wuf, 0);
    {
        let mut s = radio.0.borrow_mut();
        s.rx_len = framer::WAKE_UP_FRAME_LEN;
        s.rx = wuf.iter().copied().collect();
    }
    mac.on_shr();
    mac.on_fifop();

    // sealed under a key B does not associate with A
    let wrong_key = [0xDD; 16];
    let mut pb = Packetbuf::new();
    pb.set_receiver(ADDR_B);
    pb.set_sender(ADDR_A);
    pb.set_frame_type(FrameType::Data);
    pb.copy_from(b"sixteen byte msg").unwrap();
    let mut counters = OutgoingCounters::default();
    akes154::anti_replay::set_counter(&mut pb, &mut counters, None, &mut IgnoreExhaustion);
    let mut sender_ccm = CcmStar::new(SoftAes128::new());
    let mut sender_nbrs = NbrTable::new();
    let mut hello_bucket = LeakyBucket::new(20, 15_000);
    let mut helloack_bucket = LeakyBucket::new(20, 15_000);
    let mut ctx = FramerContext {
        ccm: &mut sender_ccm,
        nbrs: &mut sender_nbrs,
        node_addr: ADDR_A,
        pan_id: PAN,
        group_key: wrong_key,
        hello_bucket: &mut hello_bucket,
        helloack_bucket: &mut helloack_bucket,
        now_ms: 0,
    };
    framer::create(&mut pb, &mut ctx).unwrap();
    pb.set_attr(Attr::UnencryptedBytes, 0);
    akes::secure(&mut pb, &mut sender_ccm, &wrong_key, &ADDR_A, 0, config::UNICAST_SEC_LVL)
        .unwrap();
    let mut frame = pb.hdrptr().to_vec();
    let fcs = framer::FCS.checksum(&frame).to_le_bytes();
    frame.extend_from_slice(&fcs);

    {
        let mut s = radio.0.borrow_mut();
        s.rx_len = frame.len();
        s.rx = frame.iter().copied().collect();
    }
    mac.on_shr();
    mac.on_fifop();

    // the wrong-key OTP already fails the filter: no ack was prepared and
    // nothing is ever transmitted
    let s = radio.0.borrow();
    assert!(s.transmitted.is_empty());
    assert!(!s.is_on);
}
