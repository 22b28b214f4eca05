use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{oneshot, Mutex, Semaphore};

use crate::protocol::opcodes::NackReason;
use crate::service_link::LinkError;

pub type SetupResult = Result<u32, LinkError>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CircuitRole {
    Requester,
    Acceptor,
}

/// Client-side state of one virtual connection.
///
/// Send credits are permits of a semaphore: sending a data frame consumes one permit for good,
///  and each MESSAGE_VIRTUAL_ACK adds the credits it carries. Closing the semaphore wakes
///  senders waiting for credits.
pub struct Circuit {
    pub index: u64,
    pub role: CircuitRole,
    established: AtomicBool,
    send_credits: Semaphore,
    /// credits the requester offered in CREATE_VIRTUAL, granted when the setup completes
    offered_credits: u32,
    setup_waiter: Mutex<Option<oneshot::Sender<SetupResult>>>,
}

impl Circuit {
    pub fn new_requester(index: u64, setup_waiter: Option<oneshot::Sender<SetupResult>>) -> Circuit {
        Circuit {
            index,
            role: CircuitRole::Requester,
            established: AtomicBool::new(false),
            send_credits: Semaphore::new(0),
            offered_credits: 0,
            setup_waiter: Mutex::new(setup_waiter),
        }
    }

    pub fn new_acceptor(index: u64, offered_credits: u32) -> Circuit {
        Circuit {
            index,
            role: CircuitRole::Acceptor,
            established: AtomicBool::new(false),
            send_credits: Semaphore::new(0),
            offered_credits,
            setup_waiter: Mutex::new(None),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Marks the circuit as established, granting `credits` for sending. Returns false if it
    ///  was established before.
    pub async fn establish(&self, credits: u32) -> bool {
        if self.established.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.send_credits.add_permits(credits as usize);
        if let Some(waiter) = self.setup_waiter.lock().await.take() {
            let _ = waiter.send(Ok(credits));
        }
        true
    }

    /// acceptor side: the requester's ACK_ACK makes the credits from its request usable
    pub async fn establish_as_acceptor(&self) -> bool {
        self.establish(self.offered_credits).await
    }

    pub async fn fail_setup(&self, reason: NackReason) {
        if let Some(waiter) = self.setup_waiter.lock().await.take() {
            let _ = waiter.send(Err(LinkError::Refused(reason)));
        }
    }

    /// Waits for a send credit and consumes it.
    pub async fn acquire_credit(&self) -> Result<(), LinkError> {
        let permit = self.send_credits.acquire().await
            .map_err(|_| LinkError::CircuitClosed)?;
        permit.forget();
        Ok(())
    }

    pub fn add_credits(&self, credits: u32) {
        if !self.send_credits.is_closed() {
            self.send_credits.add_permits(credits as usize);
        }
    }

    pub fn available_credits(&self) -> usize {
        self.send_credits.available_permits()
    }

    pub async fn close(&self) {
        self.send_credits.close();
        // dropping the waiter tells a pending setup that the circuit is gone
        self.setup_waiter.lock().await.take();
    }
}
