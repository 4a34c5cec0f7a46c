/// Identifies the processor a tick belongs to: a resource, or one client's
/// session on a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessorId {
    Resource(u64),
    Session { client: u64, resource: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickTask {
    /// Microseconds on the quoter timeline.
    pub time: u64,
    pub processor: ProcessorId,
}

/// A time-ordered queue of tick tasks. Tasks are appended cheaply and kept
/// as sorted runs; `merge` combines two queues in amortized O(n).
pub struct TickProcessorQueue {
    tasks: Vec<TickTask>,
    first: usize,
    top: usize,
    sorted: bool,
}

impl Default for TickProcessorQueue {
    fn default() -> Self {
        Self { tasks: Vec::new(), first: 0, top: 0, sorted: true }
    }
}

impl TickProcessorQueue {
    pub fn push(&mut self, task: TickTask) {
        if !self.is_empty() {
            if self.sorted && task < *self.tasks.last().expect("non-empty queue") {
                self.sorted = false;
            }
            if !self.sorted && task < self.tasks[self.top] {
                self.top = self.tasks.len();
            }
        }
        self.tasks.push(task);
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.tasks.len()
    }

    /// The earliest task, if any.
    pub fn peek(&mut self) -> Option<TickTask> {
        if self.is_empty() {
            return None;
        }
        self.sort();
        Some(self.tasks[self.top])
    }

    pub fn pop(&mut self) -> Option<TickTask> {
        let task = self.peek()?;
        self.first += 1;
        self.top += 1;
        debug_assert!(self.first <= self.tasks.len());
        Some(task)
    }

    /// Merges `from` into self. Both queues are sorted first; when one run
    /// entirely precedes the other the merge is a plain append.
    pub fn merge(&mut self, mut from: TickProcessorQueue) {
        debug_assert_eq!(from.first, 0);
        self.sort();
        from.sort();

        if self.is_empty() {
            std::mem::swap(&mut self.tasks, &mut from.tasks);
            self.first = 0;
            self.top = 0;
            return;
        } else if from.is_empty() {
            return;
        }

        if *self.tasks.last().expect("non-empty queue") <= from.tasks[0] {
            if self.first > 0 {
                let count = self.tasks.len() - self.first;
                if 2 * count < self.tasks.len() {
                    // Compact the consumed prefix before appending.
                    self.tasks.drain(..self.first);
                    self.first = 0;
                    self.top = 0;
                }
            }
            self.tasks.append(&mut from.tasks);
            return;
        }

        let mut dest = Vec::with_capacity(self.tasks.len() - self.first + from.tasks.len());
        let mut left = self.tasks[self.first..].iter().copied().peekable();
        let mut right = from.tasks.iter().copied().peekable();
        loop {
            match (left.peek(), right.peek()) {
                (Some(a), Some(b)) => {
                    if a <= b {
                        dest.push(left.next().expect("peeked"));
                    } else {
                        dest.push(right.next().expect("peeked"));
                    }
                }
                (Some(_), None) => dest.push(left.next().expect("peeked")),
                (None, Some(_)) => dest.push(right.next().expect("peeked")),
                (None, None) => break,
            }
        }
        self.tasks = dest;
        self.first = 0;
        self.top = 0;
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.tasks[self.first..].sort();
            self.top = self.first;
            self.sorted = true;
        }
    }
}
