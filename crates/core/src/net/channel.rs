use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

/// Raw datagram transport underneath the cipher. Delivery is unordered and
/// lossy; sequence numbers, not arrival order, decide what is newest.
pub trait DatagramChannel {
    fn transmit(&mut self, data: &[u8]) -> io::Result<()>;

    fn receive(&mut self) -> io::Result<Option<Vec<u8>>>;
}

type Queue = Rc<RefCell<VecDeque<Vec<u8>>>>;

/// In-memory channel pair for tests and listen servers, single-threaded.
#[derive(Debug, Clone)]
pub struct LoopbackChannel {
    outgoing: Queue,
    incoming: Queue,
}

impl LoopbackChannel {
    pub fn pair() -> (Self, Self) {
        let a: Queue = Rc::default();
        let b: Queue = Rc::default();
        (
            Self {
                outgoing: Rc::clone(&a),
                incoming: Rc::clone(&b),
            },
            Self {
                outgoing: b,
                incoming: a,
            },
        )
    }

    pub fn pending(&self) -> usize {
        self.incoming.borrow().len()
    }

    /// Drops everything queued towards this end.
    pub fn discard_incoming(&mut self) -> usize {
        let mut queue = self.incoming.borrow_mut();
        let count = queue.len();
        queue.clear();
        count
    }

    /// Reverses the order of datagrams queued towards this end.
    pub fn reorder_incoming(&mut self) {
        let mut queue = self.incoming.borrow_mut();
        queue.make_contiguous().reverse();
    }
}

impl DatagramChannel for LoopbackChannel {
    fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
        self.outgoing.borrow_mut().push_back(data.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.incoming.borrow_mut().pop_front())
    }
}
