//! Scripted UART
//!
//! Every write pops the next canned reply into the receive buffer, so a
//! test lists exactly what the meter says to each request in order.

use std::collections::VecDeque;

use multical402::core::Uart;
use multical402::error::{KmpError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Raw bytes the meter sends back
    Bytes(Vec<u8>),
    /// Nothing at all
    Silence,
    /// The write itself fails
    WriteError,
}

#[derive(Debug, Default)]
pub struct ScriptedUart {
    replies: VecDeque<Reply>,
    rx: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

impl ScriptedUart {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, reply: Reply) {
        self.replies.push_back(reply);
    }

    /// Every request written so far
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    pub fn remaining(&self) -> usize {
        self.replies.len()
    }
}

impl Uart for ScriptedUart {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self.replies.pop_front() {
            Some(Reply::WriteError) => Err(KmpError::io("scripted write failure")),
            Some(Reply::Bytes(reply)) => {
                self.written.push(bytes.to_vec());
                self.rx.extend(reply);
                Ok(())
            },
            Some(Reply::Silence) | None => {
                self.written.push(bytes.to_vec());
                Ok(())
            },
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        Ok(self.rx.pop_front())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }
}
