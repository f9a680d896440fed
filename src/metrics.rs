use crate::sequencer::Sequencer;

/// Counters for a single tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// `false` for frames that were never used, so they can be excluded from averages
    pub init: bool,
    pub connection_count: usize,

    pub send_count: u64,
    pub send_bytes: u64,
    pub resend_count: u64,
    pub resend_bytes: u64,
    pub receive_count: u64,
    pub receive_bytes: u64,

    pub send_unconnected_count: u64,
    pub send_unconnected_bytes: u64,
    pub receive_unconnected_count: u64,
    pub receive_unconnected_bytes: u64,

    pub send_messages_unreliable_count: u64,
    pub send_messages_unreliable_bytes: u64,
    pub send_messages_reliable_count: u64,
    pub send_messages_reliable_bytes: u64,
    pub send_messages_notify_count: u64,
    pub send_messages_notify_bytes: u64,

    pub receive_messages_unreliable_count: u64,
    pub receive_messages_unreliable_bytes: u64,
    pub receive_messages_reliable_count: u64,
    pub receive_messages_reliable_bytes: u64,
    pub receive_messages_notify_count: u64,
    pub receive_messages_notify_bytes: u64,
}

impl Frame {
    pub fn send_messages_count_total(&self) -> u64 {
        self.send_messages_unreliable_count + self.send_messages_reliable_count + self.send_messages_notify_count
    }

    pub fn receive_messages_count_total(&self) -> u64 {
        self.receive_messages_unreliable_count + self.receive_messages_reliable_count + self.receive_messages_notify_count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Unreliable,
    Reliable,
    Notify,
}

/// Per-tick traffic statistics, keeping the most recent `2^bits` ticks in a ring
pub struct Metrics {
    sequencer: Sequencer,
    frames: Vec<Frame>,
    tick: u64,
}

impl Metrics {
    pub fn new(bits: u32) -> anyhow::Result<Metrics> {
        if bits > 16 {
            anyhow::bail!("metrics keep at most 2^16 frames, requested 2^{}", bits);
        }
        let sequencer = Sequencer::new(bits)?;
        Ok(Metrics {
            frames: vec![Frame::default(); sequencer.size() as usize],
            sequencer,
            tick: 0,
        })
    }

    /// the frame that is currently being recorded
    pub fn current(&self) -> &Frame {
        &self.frames[self.tick as usize]
    }

    /// all frames, in ring order - frames that were never used have `init == false`
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn on_tick(&mut self, connection_count: usize) {
        self.tick = self.sequencer.next_after(self.tick);
        self.frames[self.tick as usize] = Frame {
            init: true,
            connection_count,
            ..Frame::default()
        };
    }

    fn frame(&mut self) -> &mut Frame {
        &mut self.frames[self.tick as usize]
    }

    pub fn on_send(&mut self, len: usize) {
        let frame = self.frame();
        frame.send_count += 1;
        frame.send_bytes += len as u64;
    }

    pub fn on_resend(&mut self, len: usize) {
        let frame = self.frame();
        frame.resend_count += 1;
        frame.resend_bytes += len as u64;
    }

    pub fn on_receive(&mut self, len: usize) {
        let frame = self.frame();
        frame.receive_count += 1;
        frame.receive_bytes += len as u64;
    }

    pub fn on_send_unconnected(&mut self, len: usize) {
        let frame = self.frame();
        frame.send_unconnected_count += 1;
        frame.send_unconnected_bytes += len as u64;
    }

    pub fn on_receive_unconnected(&mut self, len: usize) {
        let frame = self.frame();
        frame.receive_unconnected_count += 1;
        frame.receive_unconnected_bytes += len as u64;
    }

    pub fn on_send_message(&mut self, kind: MessageKind, len: usize) {
        let frame = self.frame();
        let (count, bytes) = match kind {
            MessageKind::Unreliable => (&mut frame.send_messages_unreliable_count, &mut frame.send_messages_unreliable_bytes),
            MessageKind::Reliable => (&mut frame.send_messages_reliable_count, &mut frame.send_messages_reliable_bytes),
            MessageKind::Notify => (&mut frame.send_messages_notify_count, &mut frame.send_messages_notify_bytes),
        };
        *count += 1;
        *bytes += len as u64;
    }

    pub fn on_receive_message(&mut self, kind: MessageKind, len: usize) {
        let frame = self.frame();
        let (count, bytes) = match kind {
            MessageKind::Unreliable => (&mut frame.receive_messages_unreliable_count, &mut frame.receive_messages_unreliable_bytes),
            MessageKind::Reliable => (&mut frame.receive_messages_reliable_count, &mut frame.receive_messages_reliable_bytes),
            MessageKind::Notify => (&mut frame.receive_messages_notify_count, &mut frame.receive_messages_notify_bytes),
        };
        *count += 1;
        *bytes += len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_into_current_frame() {
        let mut metrics = Metrics::new(2).unwrap();
        metrics.on_tick(3);
        metrics.on_send(10);
        metrics.on_send(5);
        metrics.on_resend(7);
        metrics.on_receive(4);
        metrics.on_send_message(MessageKind::Reliable, 3);
        metrics.on_receive_message(MessageKind::Notify, 2);

        let frame = metrics.current();
        assert!(frame.init);
        assert_eq!(frame.connection_count, 3);
        assert_eq!((frame.send_count, frame.send_bytes), (2, 15));
        assert_eq!((frame.resend_count, frame.resend_bytes), (1, 7));
        assert_eq!((frame.receive_count, frame.receive_bytes), (1, 4));
        assert_eq!(frame.send_messages_count_total(), 1);
        assert_eq!(frame.receive_messages_count_total(), 1);
    }

    #[test]
    fn test_tick_resets_and_wraps() {
        let mut metrics = Metrics::new(2).unwrap();
        metrics.on_tick(1);
        metrics.on_send(10);

        for _ in 0..4 {
            metrics.on_tick(2);
        }

        assert_eq!(metrics.current().send_count, 0);
        assert_eq!(metrics.current().connection_count, 2);
        assert_eq!(metrics.frames().len(), 4);
        assert!(metrics.frames().iter().all(|f| f.init));
    }

    #[test]
    fn test_unused_frames_are_not_init() {
        let mut metrics = Metrics::new(3).unwrap();
        metrics.on_tick(0);
        assert_eq!(metrics.frames().iter().filter(|f| f.init).count(), 1);
    }
}
