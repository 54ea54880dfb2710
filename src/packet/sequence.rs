use std::sync::atomic::{AtomicU32, Ordering};

/// 进程级序列号
pub static SEQUENCE: Sequence = Sequence::new();

/// 单调递增的序列号生成器，0 保留不用，到达 u32::MAX 后回到 1
#[derive(Debug)]
pub struct Sequence {
    num: AtomicU32,
}

impl Sequence {
    pub const fn new() -> Self {
        Self {
            num: AtomicU32::new(0),
        }
    }

    /// 获取下一个序列号
    pub fn next(&self) -> u32 {
        let mut current = self.num.load(Ordering::Relaxed);
        loop {
            let next = if current == u32::MAX { 1 } else { current + 1 };
            match self
                .num
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// 获取当前序列号（不递增）
    pub fn current(&self) -> u32 {
        self.num.load(Ordering::Acquire)
    }

    #[cfg(test)]
    fn starting_at(value: u32) -> Self {
        Self {
            num: AtomicU32::new(value),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}
