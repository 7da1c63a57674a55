//! ChunkBuffer — FIFO of pending chunks with incremental size accounting.
//!
//! `size` is adjusted on every enqueue and dequeue and is never recomputed
//! by sweeping the queue. Sinks and sources each own one of these.

use std::collections::VecDeque;

use crate::chunk::{Chunk, Mode};

#[derive(Debug)]
pub struct ChunkBuffer<T> {
    chunks: VecDeque<T>,
    size: usize,
    high_water_mark: usize,
    mode: Mode,
}

impl<T: Chunk> ChunkBuffer<T> {
    pub fn new(high_water_mark: usize, mode: Mode) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            high_water_mark,
            mode,
        }
    }

    /// Append a chunk. Returns the units it added to `size`.
    pub fn enqueue(&mut self, chunk: T) -> usize {
        let units = self.mode.measure(&chunk);
        self.size += units;
        self.chunks.push_back(chunk);
        units
    }

    pub fn dequeue_one(&mut self) -> Option<T> {
        let chunk = self.chunks.pop_front()?;
        self.size -= self.mode.measure(&chunk);
        Some(chunk)
    }

    /// Remove every queued chunk at once.
    pub fn dequeue_all(&mut self) -> Vec<T> {
        self.size = 0;
        self.chunks.drain(..).collect()
    }

    /// Remove chunks totalling at most `units`, splitting the last one when
    /// the chunk type allows it. An indivisible chunk larger than `units`
    /// is returned whole when nothing else was taken, so callers always make
    /// progress.
    pub fn take_units(&mut self, units: usize) -> Vec<T> {
        let mut out = Vec::new();
        let mut taken = 0;

        while taken < units {
            let mode = self.mode;
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let weight = mode.measure(front);

            if taken + weight <= units {
                if let Some(chunk) = self.dequeue_one() {
                    taken += weight;
                    out.push(chunk);
                }
                continue;
            }

            match front.split_front(units - taken) {
                Some(head) => {
                    let head_units = mode.measure(&head);
                    self.size -= head_units;
                    out.push(head);
                }
                None if out.is_empty() => {
                    if let Some(chunk) = self.dequeue_one() {
                        out.push(chunk);
                    }
                }
                None => {}
            }
            break;
        }

        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    pub fn is_over_high_water_mark(&self) -> bool {
        self.size >= self.high_water_mark
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
