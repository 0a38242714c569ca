//! The duty-cycled MAC core.
//!
//! Two cooperating state machines share one rtimer and one radio:
//!
//!  - the *duty cycle* samples the channel once per wake-up interval, chases
//!    a detected wake-up sequence to its rendezvous, receives the payload
//!    frame, and answers it with the acknowledgment that the frame filter
//!    synthesized in interrupt context
//!  - the *transmission* waits for the instant the synchronizer picked,
//!    checks the channel once, streams the wake-up sequence (refilling the
//!    radio's small TX FIFO on a timer, counting the rendezvous field down
//!    frame by frame), sends the payload frame, and listens for the
//!    acknowledgment
//!
//! Interrupt callbacks ([`Mac::on_shr`], [`Mac::on_fifop`],
//! [`Mac::on_txdone`], [`Mac::on_timer`]) record what happened and advance
//! whichever machine is active. Everything that is neither hard-real-time
//! nor interrupt-synchronous happens in `post_process`: delivering verified
//! frames upward, running the key-establishment handlers, picking queued
//! frames, and arming the next wake-up.

use rand_core::RngCore;

use crate::akes::{self, Akes, Reply};
use crate::anti_replay;
use crate::ccm_inputs;
use crate::channel_selector::ChannelSelector;
use crate::config::{
    self, ACKNOWLEDGMENT_WINDOW_MAX, CCA_SLEEP_DURATION, CCA_THRESHOLD_COLLISION_AVOIDANCE,
    CCA_THRESHOLD_TRANSMISSION_DETECTION, FIRST_CHANNEL, INTER_CCA_PERIOD, MAX_CCAS, MAX_NOISE,
    RENDEZVOUS_GUARD_TIME, WAKE_UP_COUNTER_INTERVAL, WAKE_UP_SEQUENCE_GUARD_TIME,
};
use crate::crypto::{Aes128, CcmStar, AES_128_KEY_LENGTH, CCM_STAR_NONCE_LENGTH};
use crate::frame_queue::FrameQueue;
use crate::framer::{self, Acknowledgment, FrameKind, FramerContext, FCS, FCS_LEN};
use crate::leaky_bucket::LeakyBucket;
use crate::nbr::{NbrTable, Phase};
use crate::packetbuf::{Attr, FrameType, Packetbuf};
use crate::radio::Radio;
use crate::synchronizer::{self, Schedule};
use crate::time::{Rtimer, RtimerClock, SlowClock};
use crate::wake_up_counter::{self, WakeUpCounter};
use crate::{
    Error, InputCallback, LinkAddr, PanId, RebootPolicy, SentCallback, TxResult, LINKADDR_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    DutyCycling,
    Transmitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DutyState {
    #[default]
    Cca,
    BetweenCcas,
    AwaitingWakeUpFrame,
    WaitingForRendezvous,
    AwaitingPayloadShr,
    AwaitingPayloadFifop,
    AwaitingFinalFifop,
    AwaitingAckTxdone,
}

#[derive(Default)]
struct DutyCycle {
    state: DutyState,
    cca_count: u8,
    got_wake_up_shr: bool,
    wake_up_frame_sfd: RtimerClock,
    rendezvous_time: RtimerClock,
    noise_grace_given: bool,
    got_payload_shr: bool,
    shall_send_acknowledgment: bool,
    acknowledgment: Acknowledgment,
    kind: Option<FrameKind>,
    strobe_index: u8,
    got_frame: bool,
    read_and_parsed: bool,
    frame_pending: bool,
    hello_was_authentic: bool,
    /// Completed, verified frames of this cycle (burst reception).
    frames_received: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TxState {
    #[default]
    AwaitingSlot,
    CollisionCca,
    Streaming,
    Finishing,
    AwaitingAckShr,
    AwaitingBurstTxdone,
}

const FRAME_BUF: usize = 168;

struct Transmit {
    state: TxState,
    entry: usize,
    kind: FrameKind,
    is_broadcast: bool,
    schedule: Schedule,
    /// Secured frame image, FCS included.
    frame: [u8; FRAME_BUF],
    frame_len: usize,
    strobe_index: u8,
    expected_ack_len: usize,
    ack_key: [u8; AES_128_KEY_LENGTH],
    ack_nonce: [u8; CCM_STAR_NONCE_LENGTH],
    wake_up_frame: [u8; framer::WAKE_UP_FRAME_LEN],
    sent_wake_up_frames: u16,
    channel: u8,
    waiting_for_ack_shr: bool,
    got_ack_shr: bool,
    delta: u8,
}

impl Default for Transmit {
    fn default() -> Self {
        Self {
            state: TxState::default(),
            entry: 0,
            kind: FrameKind::UnicastData,
            is_broadcast: false,
            schedule: Schedule::default(),
            frame: [0; FRAME_BUF],
            frame_len: 0,
            strobe_index: 0,
            expected_ack_len: 0,
            ack_key: [0; AES_128_KEY_LENGTH],
            ack_nonce: [0; CCM_STAR_NONCE_LENGTH],
            wake_up_frame: [0; framer::WAKE_UP_FRAME_LEN],
            sent_wake_up_frames: 0,
            channel: FIRST_CHANNEL,
            waiting_for_ack_shr: false,
            got_ack_shr: false,
            delta: 0,
        }
    }
}

const MAX_RX_BURST: usize = config::MAX_BURST_INDEX as usize + 1;

fn akes_frame_sent(_ptr: usize, _result: TxResult, _transmissions: u8) {}

pub struct Mac<R, T, C, A, G, B>
where
    R: Radio,
    T: Rtimer,
    C: SlowClock,
    A: Aes128,
    G: RngCore,
    B: RebootPolicy,
{
    radio: R,
    rtimer: T,
    clock: C,
    rng: G,
    reboot: B,
    ccm: CcmStar<A>,

    node_addr: LinkAddr,
    pan_id: PanId,
    akes: Akes,
    nbrs: NbrTable,
    queue: FrameQueue,
    counters: anti_replay::OutgoingCounters,
    hello_bucket: LeakyBucket,
    helloack_bucket: LeakyBucket,

    /// Outgoing frames are staged here by the upper layer.
    pb_tx: Packetbuf,
    /// Reception buffers, one per bursted frame of a cycle.
    pb_rx: [Packetbuf; MAX_RX_BURST],

    mode: Mode,
    duty: DutyCycle,
    tx: Transmit,

    last_wake_up_time: RtimerClock,
    my_wake_up_counter: WakeUpCounter,
    sfd_timestamp: RtimerClock,
    can_skip: bool,
    skipped: bool,
    enabled: bool,
    seqno: u8,
    input: Option<(InputCallback, usize)>,
}

impl<R, T, C, A, G, B> Mac<R, T, C, A, G, B>
where
    R: Radio,
    T: Rtimer,
    C: SlowClock,
    A: Aes128,
    G: RngCore,
    B: RebootPolicy,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        radio: R,
        rtimer: T,
        clock: C,
        mut rng: G,
        reboot: B,
        aes: A,
        node_addr: LinkAddr,
        pan_id: PanId,
        master_secret: [u8; AES_128_KEY_LENGTH],
    ) -> Self {
        let akes = Akes::new(master_secret, &mut rng);
        Self {
            radio,
            rtimer,
            clock,
            rng,
            reboot,
            ccm: CcmStar::new(aes),
            node_addr,
            pan_id,
            akes,
            nbrs: NbrTable::new(),
            queue: FrameQueue::new(),
            counters: anti_replay::OutgoingCounters::default(),
            hello_bucket: LeakyBucket::new(
                config::HELLO_BUCKET_CAPACITY,
                config::BUCKET_LEAKAGE_SECONDS * 1000,
            ),
            helloack_bucket: LeakyBucket::new(
                config::HELLOACK_BUCKET_CAPACITY,
                config::BUCKET_LEAKAGE_SECONDS * 1000,
            ),
            pb_tx: Packetbuf::new(),
            pb_rx: core::array::from_fn(|_| Packetbuf::new()),
            mode: Mode::Idle,
            duty: DutyCycle::default(),
            tx: Transmit::default(),
            last_wake_up_time: 0,
            my_wake_up_counter: WakeUpCounter::default(),
            sfd_timestamp: 0,
            can_skip: false,
            skipped: false,
            enabled: false,
            seqno: 0,
            input: None,
        }
    }

    /// Registers the upward delivery path.
    pub fn set_input_callback(&mut self, callback: InputCallback, token: usize) {
        self.input = Some((callback, token));
    }

    /// The neighbor table, e.g. for hosts that provision keys out of band.
    pub fn neighbors(&self) -> &NbrTable {
        &self.nbrs
    }

    pub fn neighbors_mut(&mut self) -> &mut NbrTable {
        &mut self.nbrs
    }

    /// The key-establishment engine (group key, trickle schedule).
    pub fn akes(&self) -> &Akes {
        &self.akes
    }

    pub fn akes_mut(&mut self) -> &mut Akes {
        &mut self.akes
    }

    /// The radio, for the host's interrupt glue.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// The local wake-up counter value at rtimer time `t`.
    pub fn wake_up_counter_at(&self, t: RtimerClock) -> WakeUpCounter {
        let (epochs, _) = wake_up_counter::increments(t.wrapping_sub(self.last_wake_up_time));
        WakeUpCounter(self.my_wake_up_counter.0.wrapping_add(epochs))
    }

    /// Brings the layer up: arms the first wake-up and starts announcing
    /// ourselves with trickled HELLOs.
    pub fn start(&mut self) {
        self.enabled = true;
        let now_ms = self.clock.uptime_ms();
        self.akes.trickle.start(now_ms, &mut self.rng);
        let now = self.rtimer.now();
        self.last_wake_up_time = now;
        self.rtimer
            .schedule(now.wrapping_add(WAKE_UP_COUNTER_INTERVAL));
    }

    pub fn on(&mut self) {
        self.enabled = true;
    }

    pub fn off(&mut self) {
        self.enabled = false;
    }

    /// Payload bytes a single unicast data frame can carry.
    pub fn max_payload(&self) -> usize {
        R::MAX_PAYLOAD
            - FCS_LEN
            - framer::header_length_of(FrameKind::UnicastData)
            - config::UNICAST_MIC_LEN
    }

    /// The staging packet buffer for outgoing frames.
    pub fn packetbuf_mut(&mut self) -> &mut Packetbuf {
        &mut self.pb_tx
    }

    /// Queues the staged frame. `sent` fires once its fate is known.
    pub fn send(&mut self, sent: SentCallback, ptr: usize) {
        self.pb_tx.set_frame_type(FrameType::Data);
        self.seqno = self.seqno.wrapping_add(1);
        self.pb_tx.set_attr(Attr::MacSeqno, self.seqno as u16);
        if self.queue.add(&self.pb_tx, sent, ptr) {
            self.try_skip_to_send();
        }
    }

    /// Poll-driven delivery; nothing to do on explicit input.
    pub fn input(&mut self) {}

    fn try_skip_to_send(&mut self) {
        if !self.skipped && self.can_skip && self.rtimer.cancel() {
            self.skipped = true;
            self.can_skip = false;
            self.post_process();
        }
    }

    // --- interrupt-synchronous entry points ------------------------------

    /// Host-invoked when the rtimer fires.
    pub fn on_timer(&mut self) {
        match self.mode {
            Mode::Idle => self.start_duty_cycle(),
            Mode::DutyCycling => self.duty_on_timer(),
            Mode::Transmitting => self.tx_on_timer(),
        }
    }

    /// Host-invoked on a received or transmitted sync header.
    pub fn on_shr(&mut self) {
        let now = self.rtimer.now();
        match self.mode {
            Mode::DutyCycling => match self.duty.state {
                DutyState::AwaitingWakeUpFrame => {
                    self.duty.got_wake_up_shr = true;
                    self.duty.wake_up_frame_sfd = now;
                }
                DutyState::AwaitingPayloadShr => {
                    self.duty.got_payload_shr = true;
                    self.sfd_timestamp = now;
                    self.duty.state = DutyState::AwaitingPayloadFifop;
                    // the frame must complete within its own air time
                    self.rtimer
                        .schedule(now.wrapping_add(R::byte_time(R::MAX_PAYLOAD + 2)));
                }
                _ => {}
            },
            Mode::Transmitting => {
                if self.tx.waiting_for_ack_shr {
                    self.tx.got_ack_shr = true;
                    // resume once the whole acknowledgment is in the FIFO
                    self.rtimer.schedule(now.wrapping_add(
                        R::byte_time(self.tx.expected_ack_len + FCS_LEN + R::HEADER_LEN) + 2,
                    ));
                }
            }
            Mode::Idle => {}
        }
    }

    /// Host-invoked when the armed FIFOP byte count accumulated.
    pub fn on_fifop(&mut self) {
        if self.mode != Mode::DutyCycling {
            return;
        }
        match self.duty.state {
            DutyState::AwaitingWakeUpFrame => self.on_wake_up_frame_fifop(),
            DutyState::AwaitingPayloadFifop => self.on_payload_frame_fifop(),
            DutyState::AwaitingFinalFifop => self.on_final_fifop(),
            _ => {}
        }
    }

    /// Host-invoked when a transmission completed.
    pub fn on_txdone(&mut self) {
        match self.mode {
            Mode::DutyCycling => {
                if self.duty.state == DutyState::AwaitingAckTxdone {
                    self.on_acknowledgment_sent();
                }
            }
            Mode::Transmitting => {
                if self.tx.state == TxState::AwaitingBurstTxdone {
                    self.await_acknowledgment();
                }
            }
            Mode::Idle => {}
        }
    }

    // --- duty cycle -------------------------------------------------------

    fn start_duty_cycle(&mut self) {
        if !self.enabled {
            let now = self.rtimer.now();
            self.rtimer
                .schedule(now.wrapping_add(WAKE_UP_COUNTER_INTERVAL));
            return;
        }
        self.mode = Mode::DutyCycling;
        self.can_skip = false;
        self.duty = DutyCycle::default();
        if self.skipped {
            // a send cancelled this wake-up; go straight to post-processing
            self.skipped = false;
            self.end_duty_cycle();
            return;
        }
        let now = self.rtimer.now();
        let increments =
            wake_up_counter::round_increments(now.wrapping_sub(self.last_wake_up_time));
        self.my_wake_up_counter.0 = self.my_wake_up_counter.0.wrapping_add(increments);
        self.last_wake_up_time = now.wrapping_add(R::RECEIVE_CALIBRATION_TIME);
        let channel = self.channel_of(self.my_wake_up_counter, &self.node_addr);
        self.radio.set_channel(channel);
        self.radio.set_shr_search(false);
        self.radio.on();
        self.duty.state = DutyState::Cca;
        self.rtimer.schedule(now.wrapping_add(CCA_SLEEP_DURATION));
    }

    fn channel_of(&self, wuc: WakeUpCounter, addr: &LinkAddr) -> u8 {
        FIRST_CHANNEL + synchronizer::forecast_channel_index(wuc, addr) as u8
    }

    fn duty_on_timer(&mut self) {
        let now = self.rtimer.now();
        match self.duty.state {
            DutyState::Cca => {
                if self.radio.rssi() < CCA_THRESHOLD_TRANSMISSION_DETECTION {
                    self.radio.off();
                    self.duty.cca_count += 1;
                    if self.duty.cca_count >= MAX_CCAS {
                        self.end_duty_cycle();
                    } else {
                        self.duty.state = DutyState::BetweenCcas;
                        self.rtimer.schedule(now.wrapping_add(INTER_CCA_PERIOD));
                    }
                } else {
                    // busy: look for the wake-up frame behind the energy
                    self.radio.set_shr_search(true);
                    self.radio
                        .set_fifop_threshold(framer::WAKE_UP_FRAME_LEN + R::HEADER_LEN);
                    self.duty.state = DutyState::AwaitingWakeUpFrame;
                    self.rtimer.schedule(now.wrapping_add(MAX_NOISE));
                }
            }
            DutyState::BetweenCcas => {
                self.radio.on();
                self.duty.state = DutyState::Cca;
                self.rtimer.schedule(now.wrapping_add(CCA_SLEEP_DURATION));
            }
            DutyState::AwaitingWakeUpFrame => {
                // noise timeout; one grace period if an SHR arrived late
                if self.duty.got_wake_up_shr && !self.duty.noise_grace_given {
                    self.duty.noise_grace_given = true;
                    self.rtimer.schedule(now.wrapping_add(R::byte_time(
                        framer::WAKE_UP_FRAME_LEN + R::HEADER_LEN + R::SHR_LEN,
                    )));
                    return;
                }
                log::warn!("mac: noise or truncated wake-up frame");
                self.radio.off();
                self.end_duty_cycle();
            }
            DutyState::WaitingForRendezvous => {
                self.radio.on();
                self.radio.set_shr_search(true);
                self.radio
                    .set_fifop_threshold(framer::MIN_BYTES_FOR_FILTERING + R::HEADER_LEN);
                self.duty.state = DutyState::AwaitingPayloadShr;
                self.rtimer.schedule(
                    self.duty
                        .rendezvous_time
                        .wrapping_add(R::shr_time() + RENDEZVOUS_GUARD_TIME),
                );
            }
            DutyState::AwaitingPayloadShr => {
                log::warn!("mac: missed the payload frame");
                self.radio.off();
                self.end_duty_cycle();
            }
            DutyState::AwaitingPayloadFifop
            | DutyState::AwaitingFinalFifop
            | DutyState::AwaitingAckTxdone => {
                log::warn!("mac: reception timed out");
                self.radio.off();
                self.end_duty_cycle();
            }
        }
    }

    fn on_wake_up_frame_fifop(&mut self) {
        if !self.duty.got_wake_up_shr {
            return;
        }
        self.radio.set_fifop_threshold(0);

        let accepted = (|| -> Result<u16, Error> {
            let len = self.radio.read_phy_header().map_err(|_| Error::Err)?;
            if len != framer::WAKE_UP_FRAME_LEN {
                return Err(Error::BadLength);
            }
            let mut frame = [0u8; framer::WAKE_UP_FRAME_LEN];
            self.radio
                .read_payload(&mut frame)
                .map_err(|_| Error::Err)?;
            framer::parse_wake_up_frame(&frame, &self.node_addr)
        })();

        match accepted {
            Err(error) => {
                log::info!("mac: rejected wake-up frame: {:?}", error);
                self.radio.off();
                self.end_duty_cycle();
            }
            Ok(remaining) => {
                // SFD of the payload frame: the rest of this wake-up frame,
                // `remaining` further ones, one more SHR
                let per_frame = R::SHR_LEN + R::HEADER_LEN + framer::WAKE_UP_FRAME_LEN;
                self.duty.rendezvous_time = self.duty.wake_up_frame_sfd.wrapping_add(
                    R::byte_time(
                        framer::WAKE_UP_FRAME_LEN
                            + R::HEADER_LEN
                            + remaining as usize * per_frame
                            + R::SHR_LEN,
                    ),
                );
                if remaining >= 2 {
                    self.radio.off();
                    let wake_at = self
                        .duty
                        .rendezvous_time
                        .wrapping_sub(RENDEZVOUS_GUARD_TIME + R::RECEIVE_CALIBRATION_TIME);
                    self.duty.state = DutyState::WaitingForRendezvous;
                    if self.rtimer.schedule_precise(wake_at).is_err() {
                        // close already; stay awake instead
                        self.radio.on();
                        self.stay_awake_for_payload();
                    }
                } else {
                    self.stay_awake_for_payload();
                }
            }
        }
    }

    fn stay_awake_for_payload(&mut self) {
        self.radio
            .set_fifop_threshold(framer::MIN_BYTES_FOR_FILTERING + R::HEADER_LEN);
        self.duty.state = DutyState::AwaitingPayloadShr;
        self.rtimer.schedule(
            self.duty
                .rendezvous_time
                .wrapping_add(R::shr_time() + RENDEZVOUS_GUARD_TIME),
        );
    }

    fn on_payload_frame_fifop(&mut self) {
        if !self.duty.got_payload_shr {
            return;
        }
        // one firing per frame
        self.radio.set_fifop_threshold(R::MAX_PAYLOAD);

        let burst_index = self.duty.frames_received as usize;
        if burst_index >= MAX_RX_BURST {
            self.radio.off();
            self.end_duty_cycle();
            return;
        }

        let anything_locked =
            !self.ccm.can_use_asynchronously() || !self.nbrs.can_query_asynchronously();
        let delta = delta_of(self.sfd_timestamp, self.last_wake_up_time);

        let outcome = if anything_locked {
            Err(Error::CcmLocked)
        } else {
            let pb = &mut self.pb_rx[burst_index];
            pb.clear();
            let radio = &mut self.radio;
            let ccm = &mut self.ccm;
            let nbrs = &mut self.nbrs;
            let hello_bucket = &mut self.hello_bucket;
            let helloack_bucket = &mut self.helloack_bucket;
            let node_addr = self.node_addr;
            let pan_id = self.pan_id;
            let group_key = self.akes.group_key;
            (|| {
                let len = radio.read_phy_header().map_err(|_| Error::Err)?;
                if len < FCS_LEN {
                    return Err(Error::BadLength);
                }
                pb.set_datalen(len - FCS_LEN)?;
                let mut read = |pb: &mut Packetbuf, n: usize| -> Result<(), Error> {
                    let mut buf = [0u8; LINKADDR_SIZE];
                    let chunk = &mut buf[..n];
                    radio.read_payload(chunk).map_err(|_| Error::Err)?;
                    pb.append(chunk)
                };
                let mut ctx = FramerContext {
                    ccm,
                    nbrs,
                    node_addr,
                    pan_id,
                    group_key,
                    hello_bucket,
                    helloack_bucket,
                    now_ms: 0, // interrupt context; bucket leakage is lazy
                };
                framer::filter(pb, &mut ctx, &mut read, delta)
            })()
        };

        match outcome {
            Err(error) => {
                self.radio.off();
                log::info!("mac: rejected frame: {:?}", error);
                self.end_duty_cycle();
            }
            Ok(filtered) => {
                self.duty.kind = Some(filtered.kind);
                self.duty.strobe_index = filtered.strobe_index;
                self.duty.shall_send_acknowledgment = filtered.acknowledgment.is_some();
                if let Some(ack) = filtered.acknowledgment {
                    self.duty.acknowledgment = ack;
                    if self
                        .radio
                        .prepare(self.duty.acknowledgment.frame())
                        .is_err()
                    {
                        self.radio.off();
                        log::error!("mac: prepare of acknowledgment failed");
                        self.end_duty_cycle();
                        return;
                    }
                }
                self.radio
                    .set_fifop_threshold(self.radio.remaining_payload_bytes());
                self.duty.state = DutyState::AwaitingFinalFifop;
            }
        }
    }

    fn on_final_fifop(&mut self) {
        self.radio.set_fifop_threshold(0);
        self.duty.got_frame = true;

        if !self.duty.shall_send_acknowledgment {
            // broadcast: the rest of the frame is read in post-processing
            self.radio.off();
            self.end_duty_cycle();
            return;
        }

        if self.radio.transmit(false).is_err() {
            self.radio.off();
            log::error!("mac: transmit of acknowledgment failed");
            self.duty.got_frame = false;
            self.end_duty_cycle();
            return;
        }

        if self.received_authentic_unicast() {
            self.duty.state = DutyState::AwaitingAckTxdone;
            let now = self.rtimer.now();
            self.rtimer.schedule(
                now.wrapping_add(R::byte_time(self.duty.acknowledgment.len + R::SHR_LEN) + 4),
            );
        } else {
            // kill the in-flight acknowledgment; no false liveness signal
            self.radio.off();
            self.duty.got_frame = false;
            log::error!("mac: aborted transmission of acknowledgment");
            self.end_duty_cycle();
        }
    }

    /// Reads, parses, and verifies the received unicast in interrupt
    /// context, while the acknowledgment is being clocked out.
    fn received_authentic_unicast(&mut self) -> bool {
        let burst_index = self.duty.frames_received as usize;
        let Some(kind) = self.duty.kind else {
            return false;
        };

        if self.read_rest_and_parse(burst_index).is_err() {
            return false;
        }

        let verified = match kind {
            // verified in post-processing, under the key derived there
            FrameKind::HelloAck => true,
            FrameKind::Ack => self.verify_handshake_ack(burst_index),
            _ => self.verify_with_group_key(burst_index),
        };
        if verified {
            self.duty.read_and_parsed = true;
            self.duty.frame_pending = self.pb_rx[burst_index].attr(Attr::Pending) != 0
                && (self.duty.frames_received as usize) < MAX_RX_BURST - 1;
        }
        verified
    }

    fn read_rest_and_parse(&mut self, burst_index: usize) -> Result<(), Error> {
        let pb = &mut self.pb_rx[burst_index];
        let mut remaining = pb.remaining();
        let mut chunk = [0u8; 16];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.radio
                .read_payload(&mut chunk[..n])
                .map_err(|_| Error::Err)?;
            pb.append(&chunk[..n])?;
            remaining -= n;
        }
        let mut fcs_bytes = [0u8; FCS_LEN];
        self.radio
            .read_payload(&mut fcs_bytes)
            .map_err(|_| Error::Err)?;
        if u16::from_le_bytes(fcs_bytes) != FCS.checksum(pb.filled_bytes()) {
            log::info!("mac: bad frame check sequence");
            return Err(Error::Inauthentic);
        }
        framer::parse(pb)?;
        Ok(())
    }

    /// ACK of a handshake we answered: the echo of our challenge and of
    /// the HELLOACK's strobe index must match before the MIC even counts.
    fn verify_handshake_ack(&mut self, burst_index: usize) -> bool {
        let sender = self.pb_rx[burst_index].sender();
        let Some(tentative_index) = self.nbrs.index_of_tentative(&sender) else {
            return false;
        };
        let (q, expected_strobe, key) = {
            let Some(tentative) = self.nbrs.tentative(tentative_index) else {
                return false;
            };
            let Some(key) = tentative.tentative_pairwise_key() else {
                return false;
            };
            (tentative.q, tentative.strobe_index, *key)
        };

        let pb = &mut self.pb_rx[burst_index];
        pb.set_attr(
            Attr::UnencryptedBytes,
            (akes::ACK_DATALEN - AES_128_KEY_LENGTH) as u16,
        );
        let data = pb.dataptr();
        let echo_ok = data.len() >= akes::ACK_DATALEN
            && data[1..1 + q.len()] == q
            && data[1 + q.len()] == expected_strobe;
        let ok = echo_ok
            && akes::unsecure(
                pb,
                &mut self.ccm,
                &key,
                &self.node_addr,
                self.duty.strobe_index,
                config::UNICAST_SEC_LVL,
            )
            .is_ok();
        if !ok {
            log::error!("mac: invalid handshake ACK");
            self.nbrs.delete_tentative(tentative_index);
        }
        ok
    }

    fn verify_with_group_key(&mut self, burst_index: usize) -> bool {
        let sender = self.pb_rx[burst_index].sender();
        let Some(index) = self.nbrs.index_of_permanent(&sender) else {
            return false;
        };
        let Some(permanent) = self.nbrs.permanent(index) else {
            return false;
        };
        let key = permanent.group_key;
        let pb = &mut self.pb_rx[burst_index];
        let sec_lvl = if pb.holds_broadcast() {
            config::BROADCAST_SEC_LVL
        } else {
            config::UNICAST_SEC_LVL
        };
        let mic_len = config::mic_len(sec_lvl);
        if pb.frame_type() == FrameType::Data {
            // data payloads are encrypted in full
            pb.set_attr(Attr::UnencryptedBytes, 0);
        } else {
            let unencrypted = pb.datalen().saturating_sub(mic_len);
            pb.set_attr(Attr::UnencryptedBytes, unencrypted as u16);
        }
        akes::unsecure(
            pb,
            &mut self.ccm,
            &key,
            &self.node_addr,
            self.duty.strobe_index,
            sec_lvl,
        )
        .is_ok()
    }

    fn on_acknowledgment_sent(&mut self) {
        self.duty.frames_received += 1;
        if self.duty.frame_pending {
            // the sender chains another frame right behind our ack
            self.duty.frame_pending = false;
            self.duty.got_payload_shr = false;
            self.duty.read_and_parsed = false;
            self.duty.kind = None;
            self.radio
                .set_fifop_threshold(framer::MIN_BYTES_FOR_FILTERING + R::HEADER_LEN);
            self.duty.state = DutyState::AwaitingPayloadShr;
            let now = self.rtimer.now();
            self.rtimer
                .schedule(now.wrapping_add(ACKNOWLEDGMENT_WINDOW_MAX + R::shr_time() + 4));
        } else {
            self.radio.off();
            self.end_duty_cycle();
        }
    }

    fn end_duty_cycle(&mut self) {
        if self.duty.got_frame {
            if !self.duty.read_and_parsed {
                // broadcast frames are read and checked outside interrupt
                // context
                if self.duty.frames_received == 0
                    && self.read_rest_and_parse(0).is_ok()
                    && self.verify_broadcast(0)
                {
                    self.duty.frames_received = 1;
                }
            } else if self.duty.frames_received == 0 {
                // verified unicast whose ack-txdone never fired
                self.duty.frames_received = 1;
            }
        }
        self.radio.set_fifop_threshold(0);
        self.radio.set_shr_search(true);
        self.mode = Mode::Idle;
        self.post_process();
    }

    fn verify_broadcast(&mut self, burst_index: usize) -> bool {
        match self.duty.kind {
            Some(FrameKind::Hello) => {
                // a HELLO from a known peer must verify; from a stranger it
                // is accepted raw and judged by the handshake
                let sender = self.pb_rx[burst_index].sender();
                let known = self
                    .nbrs
                    .index_of_permanent(&sender)
                    .and_then(|i| self.nbrs.permanent(i))
                    .map(|p| p.group_key);
                let pb = &mut self.pb_rx[burst_index];
                match known {
                    Some(key) => {
                        let unencrypted =
                            pb.datalen().saturating_sub(config::BROADCAST_MIC_LEN);
                        pb.set_attr(Attr::UnencryptedBytes, unencrypted as u16);
                        let ok = akes::unsecure(
                            pb,
                            &mut self.ccm,
                            &key,
                            &self.node_addr,
                            0,
                            config::BROADCAST_SEC_LVL,
                        )
                        .is_ok();
                        self.duty.hello_was_authentic = ok;
                        ok
                    }
                    None => {
                        self.duty.hello_was_authentic = false;
                        let datalen = pb.datalen();
                        datalen
                            .checked_sub(config::BROADCAST_MIC_LEN)
                            .map(|n| pb.set_datalen(n).is_ok())
                            .unwrap_or(false)
                    }
                }
            }
            Some(_) => self.verify_with_group_key(burst_index),
            None => false,
        }
    }

    // --- post-processing --------------------------------------------------

    fn post_process(&mut self) {
        let mut just_received_broadcast = false;
        let frames = self.duty.frames_received as usize;
        for burst_index in 0..frames {
            just_received_broadcast |= self.pb_rx[burst_index].holds_broadcast();
            self.deliver(burst_index);
        }
        self.duty.frames_received = 0;
        self.duty.got_frame = false;

        let now_ms = self.clock.uptime_ms();
        let now_seconds = self.clock.uptime_seconds();

        // key-establishment housekeeping
        if self.akes.trickle.poll(now_ms, &mut self.rng) {
            let mut hello = Packetbuf::new();
            self.akes.prepare_hello(
                &mut hello,
                &mut self.counters,
                &mut self.reboot,
                &mut self.rng,
            );
            self.queue.add(&hello, akes_frame_sent, 0);
        }
        if self.akes.poll_expiry(&mut self.nbrs, now_seconds) {
            let mut update = Packetbuf::new();
            self.akes
                .prepare_update(&mut update, &mut self.counters, &mut self.reboot);
            self.queue.add(&update, akes_frame_sent, 0);
        }

        // start the next transmission unless a broadcast wants attention
        // from the whole neighborhood first
        if !just_received_broadcast {
            loop {
                let mut staging = Packetbuf::new();
                let Some(entry) = self.queue.pick(now_ms, &mut staging) else {
                    break;
                };
                if self.prepare_transmission(entry, staging) {
                    return;
                }
            }
        }

        // arm the next wake-up
        let next_wake_up = wake_up_counter::shift_to_future(
            self.last_wake_up_time
                .wrapping_sub(R::RECEIVE_CALIBRATION_TIME),
            self.rtimer.now(),
        );
        self.rtimer.schedule(next_wake_up);
        self.can_skip = true;
    }

    fn deliver(&mut self, burst_index: usize) {
        let now_seconds = self.clock.uptime_seconds();
        let pb = &self.pb_rx[burst_index];
        match pb.frame_type() {
            FrameType::Data => {
                if let Some((callback, token)) = self.input {
                    callback(token, &self.pb_rx[burst_index]);
                }
            }
            FrameType::Command => {
                let dispatch = pb.dataptr().first().copied();
                match dispatch {
                    Some(akes::CMD_HELLO) => self.handle_hello(burst_index, now_seconds),
                    Some(akes::CMD_HELLOACK) | Some(akes::CMD_HELLOACK_P) => {
                        self.handle_helloack(burst_index, now_seconds)
                    }
                    Some(akes::CMD_ACK) => {
                        let pb = self.pb_rx[burst_index].clone();
                        if let Err(error) = self.akes.on_ack(&pb, &mut self.nbrs, now_seconds) {
                            log::info!("mac: dropped handshake ACK: {:?}", error);
                        }
                    }
                    Some(akes::CMD_UPDATE) => {
                        let pb = self.pb_rx[burst_index].clone();
                        if let Err(error) = self.akes.on_update(&pb, &mut self.nbrs, now_seconds)
                        {
                            log::info!("mac: dropped UPDATE: {:?}", error);
                        }
                    }
                    _ => log::info!("mac: unknown command frame"),
                }
            }
        }
    }

    fn handle_hello(&mut self, burst_index: usize, now_seconds: u32) {
        let authentic = self.duty.hello_was_authentic;
        let hello = self.pb_rx[burst_index].clone();
        let mut helloack = Packetbuf::new();
        let outcome = self.akes.on_hello(
            &hello,
            &mut helloack,
            &mut self.nbrs,
            &mut self.ccm,
            &mut self.counters,
            &mut self.reboot,
            &mut self.rng,
            authentic,
            now_seconds,
        );
        match outcome {
            Ok(Reply::HelloAck) => {
                // pin the sender's phase so the HELLOACK can be targeted
                let sender = hello.sender();
                if let Some(index) = self.nbrs.index_of_tentative(&sender) {
                    if let Some(tentative) = self.nbrs.tentative_mut(index) {
                        tentative.phase = akes::rebase_phase(tentative.phase, self.sfd_timestamp);
                    }
                }
                self.queue.add(&helloack, akes_frame_sent, 0);
            }
            Ok(_) => {}
            Err(error) => log::info!("mac: dropped HELLO: {:?}", error),
        }
    }

    fn handle_helloack(&mut self, burst_index: usize, now_seconds: u32) {
        let mut helloack = self.pb_rx[burst_index].clone();
        helloack.set_attr(
            Attr::UnencryptedBytes,
            (akes::HELLOACK_DATALEN - AES_128_KEY_LENGTH) as u16,
        );
        let mut ack = Packetbuf::new();
        let delta = delta_of(self.sfd_timestamp, self.last_wake_up_time);
        let outcome = self.akes.on_helloack(
            &mut helloack,
            &mut ack,
            &mut self.nbrs,
            &mut self.ccm,
            &mut self.counters,
            &mut self.reboot,
            &self.node_addr,
            self.duty.strobe_index,
            delta,
            now_seconds,
        );
        match outcome {
            Ok(Reply::Ack) => {
                // rebase the piggybacked phase onto our clock
                let sender = helloack.sender();
                if let Some(index) = self.nbrs.index_of_permanent(&sender) {
                    if let Some(permanent) = self.nbrs.permanent_mut(index) {
                        permanent.sync = akes::rebase_phase(permanent.sync, self.sfd_timestamp);
                        permanent.historical_sync = permanent.sync;
                    }
                }
                self.queue.add(&ack, akes_frame_sent, 0);
            }
            Ok(_) => {}
            Err(error) => log::info!("mac: dropped HELLOACK: {:?}", error),
        }
    }

    // --- transmission -----------------------------------------------------

    /// Builds and schedules one queued frame. Returns whether a
    /// transmission now owns the rtimer.
    fn prepare_transmission(&mut self, entry: usize, staging: Packetbuf) -> bool {
        self.pb_tx = staging;
        let now_ms = self.clock.uptime_ms();
        let kind = match framer::kind_of(&self.pb_tx) {
            Ok(kind) => kind,
            Err(_) => {
                self.queue
                    .on_transmitted(TxResult::ErrFatal, entry, now_ms, &mut self.rng);
                return false;
            }
        };
        self.tx = Transmit::default();
        self.tx.entry = entry;
        self.tx.kind = kind;
        self.tx.is_broadcast = self.pb_tx.holds_broadcast();
        let receiver = self.pb_tx.receiver();
        self.tx.strobe_index = self.queue.transmissions(receiver);

        // fresh counter for every attempt, so retries are never mistaken
        // for replays
        anti_replay::set_counter(&mut self.pb_tx, &mut self.counters, None, &mut self.reboot);

        // chained frames announce themselves through the pending flag
        if !self.tx.is_broadcast {
            let has_follow_up = self.queue.burst(entry).is_some();
            self.pb_tx.set_attr(Attr::Pending, has_follow_up as u16);
        }

        // when and for how long to wake the receiver
        let wuf_air_time = R::byte_time(R::SHR_LEN + R::HEADER_LEN + framer::WAKE_UP_FRAME_LEN);
        let now = self.rtimer.now();
        let schedule = if self.tx.is_broadcast {
            Ok(synchronizer::schedule_broadcast(
                self.last_wake_up_time,
                now,
                wuf_air_time,
            ))
        } else if kind == FrameKind::HelloAck {
            match self
                .nbrs
                .index_of_tentative(&receiver)
                .and_then(|i| self.nbrs.tentative(i))
            {
                Some(tentative) => synchronizer::schedule_unicast(
                    &tentative.phase,
                    None,
                    u16::MAX,
                    &receiver,
                    now,
                    wuf_air_time,
                ),
                None => Err(Error::ErrFatal),
            }
        } else {
            match self
                .nbrs
                .index_of_permanent(&receiver)
                .and_then(|i| self.nbrs.permanent(i))
            {
                Some(permanent) => synchronizer::schedule_unicast(
                    &permanent.sync,
                    permanent.drift,
                    permanent.channels.propose_channels(),
                    &receiver,
                    now,
                    wuf_air_time,
                ),
                None => Err(Error::ErrFatal),
            }
        };
        let schedule = match schedule {
            Ok(schedule) => schedule,
            Err(_) => {
                log::error!("mac: no phase-lock data for receiver");
                self.queue
                    .on_transmitted(TxResult::ErrFatal, entry, now_ms, &mut self.rng);
                return false;
            }
        };
        self.tx.schedule = schedule;
        self.tx.channel = if self.tx.is_broadcast {
            self.channel_of(self.my_wake_up_counter, &self.node_addr)
        } else {
            self.channel_of(schedule.receivers_wake_up_counter, &receiver)
        };

        if self.build_frame(kind, schedule).is_err() {
            self.queue
                .on_transmitted(TxResult::ErrFatal, entry, now_ms, &mut self.rng);
            return false;
        }

        // acknowledgment verification material
        self.tx.expected_ack_len = if kind == FrameKind::HelloAck {
            framer::HELLOACK_ACKNOWLEDGMENT_LEN
        } else {
            framer::DEFAULT_ACKNOWLEDGMENT_LEN
        };
        self.tx.ack_key = match self.acknowledgment_key(kind, &receiver) {
            Ok(key) => key,
            Err(_) => {
                self.queue
                    .on_transmitted(TxResult::ErrFatal, entry, now_ms, &mut self.rng);
                return false;
            }
        };
        self.tx.ack_nonce =
            ccm_inputs::generate_nonce(&self.pb_tx, &self.node_addr, self.tx.strobe_index, true);
        framer::create_wake_up_frame(&mut self.tx.wake_up_frame, &receiver);

        let arm_at = schedule
            .wake_up_sequence_start
            .wrapping_sub(WAKE_UP_SEQUENCE_GUARD_TIME);
        if self.rtimer.schedule_precise(arm_at).is_err() {
            log::warn!("mac: transmission slot too close, retrying later");
            self.queue
                .on_transmitted(TxResult::Err, entry, now_ms, &mut self.rng);
            return false;
        }
        self.mode = Mode::Transmitting;
        self.tx.state = TxState::AwaitingSlot;
        true
    }

    fn acknowledgment_key(
        &self,
        kind: FrameKind,
        receiver: &LinkAddr,
    ) -> Result<[u8; AES_128_KEY_LENGTH], Error> {
        if kind == FrameKind::Ack {
            // the receiver still holds us tentative and acknowledges under
            // the derived key
            self.nbrs
                .index_of_permanent(receiver)
                .and_then(|i| self.nbrs.permanent(i))
                .map(|p| p.pairwise_key)
                .ok_or(Error::KeyNotFound)
        } else {
            // the receiver loaded our group key for the OTP check and
            // seals the acknowledgment with it
            Ok(self.akes.group_key)
        }
    }

    /// Creates the header, patches handshake piggyback fields, seals the
    /// frame, and appends the FCS into `tx.frame`.
    fn build_frame(&mut self, kind: FrameKind, schedule: Schedule) -> Result<(), Error> {
        let mut ctx = FramerContext {
            ccm: &mut self.ccm,
            nbrs: &mut self.nbrs,
            node_addr: self.node_addr,
            pan_id: self.pan_id,
            group_key: self.akes.group_key,
            hello_bucket: &mut self.hello_bucket,
            helloack_bucket: &mut self.helloack_bucket,
            now_ms: 0,
        };
        framer::create(&mut self.pb_tx, &mut ctx)?;

        let mut secured = self.pb_tx.clone();

        if matches!(kind, FrameKind::Hello | FrameKind::HelloAck) {
            let payload_sfd = schedule.payload_frame_start.wrapping_add(R::shr_time());
            let ticks_since_wake_up = payload_sfd.wrapping_sub(self.last_wake_up_time);
            let (epochs, phase_ticks) = wake_up_counter::increments(ticks_since_wake_up);
            let wuc = WakeUpCounter(self.my_wake_up_counter.0.wrapping_add(epochs));
            let hdrlen = secured.hdrlen();
            akes::patch_piggybacked_phase(secured.hdrptr_mut(), hdrlen, phase_ticks, wuc);
        }

        // the strobe index field must match the nonce
        let strobe_index = self.tx.strobe_index;
        if let Some(at) = strobe_index_position(kind) {
            secured.hdrptr_mut()[at] = strobe_index;
        }

        let key = self.sealing_key(kind)?;
        akes::secure(
            &mut secured,
            &mut self.ccm,
            &key,
            &self.node_addr,
            strobe_index,
            kind.sec_lvl(),
        )?;

        let frame = secured.hdrptr();
        if frame.len() + FCS_LEN > FRAME_BUF {
            return Err(Error::BufferFull);
        }
        self.tx.frame[..frame.len()].copy_from_slice(frame);
        let fcs = FCS.checksum(frame).to_le_bytes();
        self.tx.frame[frame.len()..frame.len() + FCS_LEN].copy_from_slice(&fcs);
        self.tx.frame_len = frame.len() + FCS_LEN;
        Ok(())
    }

    fn sealing_key(&self, kind: FrameKind) -> Result<[u8; AES_128_KEY_LENGTH], Error> {
        let receiver = self.pb_tx.receiver();
        match kind {
            FrameKind::HelloAck => self
                .nbrs
                .index_of_tentative(&receiver)
                .and_then(|i| self.nbrs.tentative(i))
                .and_then(|t| t.tentative_pairwise_key().copied())
                .ok_or(Error::KeyNotFound),
            FrameKind::Ack => self
                .nbrs
                .index_of_permanent(&receiver)
                .and_then(|i| self.nbrs.permanent(i))
                .map(|p| p.pairwise_key)
                .ok_or(Error::KeyNotFound),
            _ => Ok(self.akes.group_key),
        }
    }

    fn tx_on_timer(&mut self) {
        let now = self.rtimer.now();
        match self.tx.state {
            TxState::AwaitingSlot => {
                self.radio.set_channel(self.tx.channel);
                self.radio.on();
                self.tx.state = TxState::CollisionCca;
                self.rtimer.schedule(now.wrapping_add(CCA_SLEEP_DURATION));
            }
            TxState::CollisionCca => {
                if self.radio.rssi() >= CCA_THRESHOLD_COLLISION_AVOIDANCE {
                    self.radio.off();
                    log::info!("mac: collision");
                    self.finish_transmission(TxResult::Collision);
                    return;
                }
                if self.start_sequence().is_err() {
                    self.radio.off();
                    self.finish_transmission(TxResult::Err);
                }
            }
            TxState::Streaming => {
                if self.append_to_sequence().is_err() {
                    self.radio.off();
                    self.finish_transmission(TxResult::Err);
                }
            }
            TxState::Finishing => {
                if self.radio.finish_sequence().is_err() {
                    self.radio.off();
                    self.finish_transmission(TxResult::Err);
                    return;
                }
                if self.tx.is_broadcast {
                    self.radio.off();
                    self.finish_transmission(TxResult::Ok);
                } else {
                    self.await_acknowledgment();
                }
            }
            TxState::AwaitingAckShr => {
                if !self.tx.got_ack_shr {
                    self.radio.off();
                    log::info!("mac: received no acknowledgment");
                    self.finish_transmission(TxResult::NoAck);
                    return;
                }
                self.tx.waiting_for_ack_shr = false;
                let result = self.read_acknowledgment();
                self.radio.off();
                match result {
                    Ok(delta) => {
                        self.tx.delta = delta;
                        self.continue_burst_or_finish();
                    }
                    Err(error) => {
                        log::info!("mac: invalid acknowledgment: {:?}", error);
                        self.finish_transmission(TxResult::Collision);
                    }
                }
            }
            TxState::AwaitingBurstTxdone => {
                // txdone never came
                self.radio.off();
                self.finish_transmission(TxResult::Err);
            }
        }
    }

    fn start_sequence(&mut self) -> Result<(), Error> {
        let total = self.tx.schedule.remaining_wake_up_frames;
        let first = (total as usize).min(R::MAX_SEQUENCE_FRAMES);
        let mut frames: heapless::Vec<[u8; framer::WAKE_UP_FRAME_LEN], 16> = heapless::Vec::new();
        for i in 0..first {
            let mut wuf = self.tx.wake_up_frame;
            framer::update_rendezvous_time(&mut wuf, total - 1 - i as u16);
            frames.push(wuf).map_err(|_| Error::BufferFull)?;
        }
        let refs: heapless::Vec<&[u8], 16> = frames.iter().map(|f| f.as_slice()).collect();
        self.radio.prepare_sequence(&refs).map_err(|_| Error::Err)?;
        self.radio.transmit_sequence().map_err(|_| Error::Err)?;
        self.tx.sent_wake_up_frames = first as u16;
        self.tx.state = TxState::Streaming;
        self.schedule_next_append();
        Ok(())
    }

    fn append_to_sequence(&mut self) -> Result<(), Error> {
        let total = self.tx.schedule.remaining_wake_up_frames;
        if self.tx.sent_wake_up_frames < total {
            let batch =
                ((total - self.tx.sent_wake_up_frames) as usize).min(R::MAX_SEQUENCE_FRAMES);
            let mut frames: heapless::Vec<[u8; framer::WAKE_UP_FRAME_LEN], 16> =
                heapless::Vec::new();
            for i in 0..batch {
                let mut wuf = self.tx.wake_up_frame;
                let index = self.tx.sent_wake_up_frames + i as u16;
                framer::update_rendezvous_time(&mut wuf, total - 1 - index);
                frames.push(wuf).map_err(|_| Error::BufferFull)?;
            }
            let refs: heapless::Vec<&[u8], 16> = frames.iter().map(|f| f.as_slice()).collect();
            self.radio
                .append_to_sequence(&refs)
                .map_err(|_| Error::Err)?;
            self.tx.sent_wake_up_frames += batch as u16;
            self.schedule_next_append();
        } else {
            // the payload frame ends the sequence
            let frame_len = self.tx.frame_len;
            let frame = self.tx.frame;
            self.radio
                .append_to_sequence(&[&frame[..frame_len]])
                .map_err(|_| Error::Err)?;
            self.tx.state = TxState::Finishing;
            let payload_end = self
                .tx
                .schedule
                .payload_frame_start
                .wrapping_add(R::byte_time(R::HEADER_LEN + frame_len));
            self.rtimer.schedule(payload_end);
        }
        Ok(())
    }

    fn schedule_next_append(&mut self) {
        // refill once roughly half of what is queued has drained
        let wuf_air = R::byte_time(R::SHR_LEN + R::HEADER_LEN + framer::WAKE_UP_FRAME_LEN);
        let sent_air = self.tx.sent_wake_up_frames as u32 * wuf_air;
        let at = self.tx.schedule.wake_up_sequence_start.wrapping_add(
            sent_air.saturating_sub(wuf_air * (R::MAX_SEQUENCE_FRAMES as u32 / 2)),
        );
        if self.rtimer.schedule_precise(at).is_err() {
            let now = self.rtimer.now();
            self.rtimer.schedule(now.wrapping_add(1));
        }
    }

    fn await_acknowledgment(&mut self) {
        self.radio.on();
        self.tx.waiting_for_ack_shr = true;
        self.tx.got_ack_shr = false;
        self.tx.state = TxState::AwaitingAckShr;
        let now = self.rtimer.now();
        self.rtimer
            .schedule(now.wrapping_add(ACKNOWLEDGMENT_WINDOW_MAX + R::shr_time()));
    }

    fn read_acknowledgment(&mut self) -> Result<u8, Error> {
        let len = self.radio.read_phy_header().map_err(|_| Error::Err)?;
        if len != self.tx.expected_ack_len + FCS_LEN {
            return Err(Error::BadLength);
        }
        let mut buf = [0u8; framer::MAX_ACKNOWLEDGMENT_LEN];
        let ack = &mut buf[..len];
        self.radio.read_payload(ack).map_err(|_| Error::Err)?;
        let (body, fcs_bytes) = ack.split_at(len - FCS_LEN);
        if u16::from_le_bytes(fcs_bytes.try_into().unwrap()) != FCS.checksum(body) {
            return Err(Error::Inauthentic);
        }
        framer::parse_acknowledgment(
            body,
            self.tx.expected_ack_len,
            &self.tx.ack_nonce,
            &self.tx.ack_key,
            &mut self.ccm,
        )
    }

    fn continue_burst_or_finish(&mut self) {
        let completed = self.tx.entry;
        let burst = if self.tx.is_broadcast {
            None
        } else {
            self.queue.burst(completed)
        };
        self.apply_sync_feedback(TxResult::Ok);
        self.account_helloack();
        let now_ms = self.clock.uptime_ms();
        self.queue
            .on_transmitted(TxResult::Ok, completed, now_ms, &mut self.rng);

        let Some(next) = burst else {
            self.finish_after_completion();
            return;
        };
        // the completed entry's removal shifted everything behind it
        let next = next - 1;
        let mut staging = Packetbuf::new();
        self.queue.load(next, &mut staging);
        self.pb_tx = staging;
        let kind = match framer::kind_of(&self.pb_tx) {
            Ok(kind) => kind,
            Err(_) => {
                self.finish_after_completion();
                return;
            }
        };
        self.tx.entry = next;
        self.tx.kind = kind;
        self.tx.strobe_index = self.queue.transmissions(self.pb_tx.receiver());
        anti_replay::set_counter(&mut self.pb_tx, &mut self.counters, None, &mut self.reboot);
        // mark the chain for the receiver
        self.pb_tx
            .set_attr(Attr::Pending, (self.queue.burst(next).is_some()) as u16);
        let schedule = self.tx.schedule;
        let prepared = self.build_frame(kind, schedule).is_ok() && {
            let frame_len = self.tx.frame_len;
            let frame = self.tx.frame;
            self.radio.prepare(&frame[..frame_len]).is_ok() && self.radio.transmit(true).is_ok()
        };
        if !prepared {
            self.radio.off();
            let now_ms = self.clock.uptime_ms();
            self.queue
                .on_transmitted(TxResult::Err, next, now_ms, &mut self.rng);
            self.finish_after_completion();
            return;
        }
        self.tx.ack_nonce =
            ccm_inputs::generate_nonce(&self.pb_tx, &self.node_addr, self.tx.strobe_index, true);
        self.tx.state = TxState::AwaitingBurstTxdone;
        let now = self.rtimer.now();
        self.rtimer.schedule(
            now.wrapping_add(R::byte_time(self.tx.frame_len + R::SHR_LEN + R::HEADER_LEN) + 8),
        );
    }

    fn finish_transmission(&mut self, result: TxResult) {
        self.apply_sync_feedback(result);
        if result != TxResult::Ok {
            self.account_helloack();
        }
        let now_ms = self.clock.uptime_ms();
        self.queue
            .on_transmitted(result, self.tx.entry, now_ms, &mut self.rng);
        self.finish_after_completion();
    }

    fn finish_after_completion(&mut self) {
        self.mode = Mode::Idle;
        self.post_process();
    }

    /// Feeds the outcome into the receiver's phase lock and channel
    /// bandit.
    fn apply_sync_feedback(&mut self, result: TxResult) {
        if self.tx.is_broadcast || self.tx.kind == FrameKind::HelloAck {
            return;
        }
        let receiver = self.pb_tx.receiver();
        let Some(index) = self.nbrs.index_of_permanent(&receiver) else {
            return;
        };
        let new_sync = Phase {
            t: self
                .tx
                .schedule
                .payload_frame_start
                .wrapping_add(R::shr_time())
                .wrapping_sub((self.tx.delta as RtimerClock) << config::DELTA_SHIFT),
            wake_up_counter_at_t: self.tx.schedule.receivers_wake_up_counter,
        };
        let channel = (self.tx.channel - FIRST_CHANNEL) as usize;
        let is_handshake = self.tx.kind == FrameKind::Ack;
        if let Some(permanent) = self.nbrs.permanent_mut(index) {
            synchronizer::on_unicast_transmitted(
                permanent,
                new_sync,
                is_handshake,
                channel,
                result == TxResult::Ok,
            );
        }
    }

    fn account_helloack(&mut self) {
        if self.tx.kind != FrameKind::HelloAck {
            return;
        }
        let receiver = self.pb_tx.receiver();
        let payload_sfd = self
            .tx
            .schedule
            .payload_frame_start
            .wrapping_add(R::shr_time());
        self.akes
            .on_helloack_sent(&mut self.nbrs, &receiver, self.tx.strobe_index, payload_sfd);
    }
}

/// The (shifted) gap between the local wake-up and a frame's SFD, as
/// echoed in acknowledgments.
fn delta_of(sfd_timestamp: RtimerClock, last_wake_up_time: RtimerClock) -> u8 {
    (sfd_timestamp.wrapping_sub(last_wake_up_time) >> config::DELTA_SHIFT) as u8
}

/// Byte position of the strobe index in a serialized frame, if any.
fn strobe_index_position(kind: FrameKind) -> Option<usize> {
    match kind {
        FrameKind::UnicastData
        | FrameKind::UnicastCommand
        | FrameKind::HelloAck
        | FrameKind::Ack => Some(framer::strobe_index_offset(kind)),
        _ => None,
    }
}
