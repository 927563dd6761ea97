/// 滑动窗口模块
///
/// 固定容量的字节环形缓冲区，只保留数据流中最近的 N 个字节，
/// 用于在无限长的字节流上以 O(1) 内存检测触发序列
use crate::error::{Result, TunnelError};

/// 固定容量的 FIFO 字节窗口
///
/// 窗口满时写入新字节会覆盖最旧的字节，不会返回错误。
///
/// # 示例
/// ```rust
/// use pump_tunnel::window::SlidingWindow;
///
/// let mut window = SlidingWindow::new(4).unwrap();
/// for &b in b"xxABCD" {
///     window.push(b);
/// }
/// assert!(window.matches_prefix(b"ABCD"));
/// assert!(!window.matches_prefix(b"xABC"));
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    slots: Box<[u8]>,
    /// 最旧字节所在的槽位
    head: usize,
    len: usize,
}

impl SlidingWindow {
    /// 创建指定容量的窗口，容量必须大于 0
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TunnelError::invalid_trigger(
                "sliding window capacity must be greater than 0",
            ));
        }
        Ok(Self {
            slots: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        })
    }

    /// 创建容量恰好等于给定序列长度的窗口
    pub fn for_sequence(sequence: &[u8]) -> Result<Self> {
        if sequence.is_empty() {
            return Err(TunnelError::invalid_trigger("trigger sequence is empty"));
        }
        Self::new(sequence.len())
    }

    /// 追加一个字节；窗口已满时先淘汰最旧的字节
    pub fn push(&mut self, byte: u8) {
        let capacity = self.slots.len();
        if self.len < capacity {
            self.slots[(self.head + self.len) % capacity] = byte;
            self.len += 1;
        } else {
            self.slots[self.head] = byte;
            self.head = (self.head + 1) % capacity;
        }
    }

    /// 窗口中最旧的 `sequence.len()` 个字节是否逐字节等于 `sequence`
    ///
    /// 窗口中的字节数少于序列长度时永远不匹配，空序列也不匹配。
    pub fn matches_prefix(&self, sequence: &[u8]) -> bool {
        if sequence.is_empty() || sequence.len() > self.len {
            return false;
        }
        sequence
            .iter()
            .zip(self.iter())
            .all(|(expected, actual)| *expected == actual)
    }

    /// 按到达顺序（最旧的在前）遍历窗口内容
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        let capacity = self.slots.len();
        (0..self.len).map(move |i| self.slots[(self.head + i) % capacity])
    }

    /// 当前保存的字节数
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
