/// 单向字节泵
///
/// 从一个字节源读取数据，原样写入主输出和可选的旁路输出（例如抓包文件），
/// 并可在检测到触发序列后插入一个修正字节
use crate::error::{Result, TunnelError};
use crate::session::Teardown;
use crate::transport::{ByteSink, ByteSource};
use crate::window::SlidingWindow;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// 单次读取的缓冲区大小
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// 中继方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 客户端 → 上游
    ClientToUpstream,
    /// 上游 → 客户端
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// 触发序列及其期望的后续字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    sequence: Vec<u8>,
    continuation: u8,
}

impl Trigger {
    /// 创建触发器，序列不能为空
    pub fn new(sequence: impl Into<Vec<u8>>, continuation: u8) -> Result<Self> {
        let sequence = sequence.into();
        if sequence.is_empty() {
            return Err(TunnelError::invalid_trigger("trigger sequence is empty"));
        }
        Ok(Self {
            sequence,
            continuation,
        })
    }

    pub fn sequence(&self) -> &[u8] {
        &self.sequence
    }

    pub fn continuation(&self) -> u8 {
        self.continuation
    }
}

/// 一个触发器和它独占的滑动窗口
#[derive(Debug, Clone)]
struct Guard {
    trigger: Trigger,
    window: SlidingWindow,
}

/// 单个方向上的触发修正器
///
/// 检查总是基于读入当前字节之前的窗口状态进行，插入的修正字节不会进入窗口。
#[derive(Debug, Clone)]
pub struct TriggerCorrector {
    guards: Vec<Guard>,
}

impl TriggerCorrector {
    /// 按注册顺序创建，每个触发器使用与序列等长的窗口
    pub fn new(triggers: &[Trigger]) -> Result<Self> {
        let guards = triggers
            .iter()
            .map(|trigger| {
                Ok(Guard {
                    window: SlidingWindow::for_sequence(trigger.sequence())?,
                    trigger: trigger.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { guards })
    }

    /// 即将转发 `next` 时需要插入的修正字节
    ///
    /// 第一个“窗口匹配且 `next` 不是期望字节”的触发器生效，每个输入字节最多插入一次。
    pub fn correction_for(&self, next: u8) -> Option<u8> {
        self.guards
            .iter()
            .find(|guard| {
                guard.trigger.continuation != next
                    && guard.window.matches_prefix(&guard.trigger.sequence)
            })
            .map(|guard| guard.trigger.continuation)
    }

    /// 将已转发的字节送入所有窗口
    pub fn observe(&mut self, byte: u8) {
        for guard in &mut self.guards {
            guard.window.push(byte);
        }
    }

    /// 处理一段输入，把（可能带修正字节的）输出追加到 `out`，返回插入的字节数
    pub fn apply(&mut self, input: &[u8], out: &mut BytesMut) -> usize {
        out.reserve(input.len());
        let mut injected = 0;
        for &byte in input {
            if let Some(fix) = self.correction_for(byte) {
                out.put_u8(fix);
                injected += 1;
            }
            out.put_u8(byte);
            self.observe(byte);
        }
        injected
    }

    pub fn trigger_count(&self) -> usize {
        self.guards.len()
    }
}

/// 泵内部的 I/O 失败，不会向会话传播，只记录在报告中
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// 泵的结束方式
#[derive(Debug)]
pub enum PumpOutcome {
    /// 源端正常结束
    EndOfStream,
    /// 会话已被拆除（另一方向失败或结束）
    Aborted,
    /// 读写失败
    Failed(PumpError),
}

impl PumpOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, PumpOutcome::Failed(_))
    }
}

/// 单个方向的运行结果
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    pub outcome: PumpOutcome,
    /// 从源读取的字节数
    pub bytes_read: u64,
    /// 写入主输出的字节数（包含插入的修正字节）
    pub bytes_written: u64,
    /// 插入的修正字节数
    pub corrections: u64,
}

/// 单向字节泵
pub struct StreamPump {
    direction: Direction,
    source: Box<dyn ByteSource>,
    /// 第一个为主输出，第二个（如果有）为旁路输出
    sinks: Vec<Box<dyn ByteSink>>,
    corrector: Option<TriggerCorrector>,
    teardown: Arc<Teardown>,
    close_on_eof: bool,
    bytes_read: u64,
    bytes_written: u64,
    corrections: u64,
}

impl StreamPump {
    pub fn new<S, W>(direction: Direction, source: S, primary: W, teardown: Arc<Teardown>) -> Self
    where
        S: ByteSource,
        W: ByteSink,
    {
        Self {
            direction,
            source: Box::new(source),
            sinks: vec![Box::new(primary)],
            corrector: None,
            teardown,
            close_on_eof: true,
            bytes_read: 0,
            bytes_written: 0,
            corrections: 0,
        }
    }

    /// 设置旁路输出；重复调用会替换之前的旁路输出
    pub fn with_secondary(mut self, sink: Box<dyn ByteSink>) -> Self {
        self.sinks.truncate(1);
        self.sinks.push(sink);
        self
    }

    /// 注册触发器；空列表表示关闭修正
    pub fn with_triggers(mut self, triggers: &[Trigger]) -> Result<Self> {
        self.corrector = if triggers.is_empty() {
            None
        } else {
            Some(TriggerCorrector::new(triggers)?)
        };
        Ok(self)
    }

    /// 源端正常结束时是否拆除整个会话（否则只向对端发送 FIN）
    pub fn close_on_eof(mut self, close: bool) -> Self {
        self.close_on_eof = close;
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// 运行直到源端结束、读写失败或会话被拆除
    pub async fn run(mut self) -> PumpReport {
        let teardown = self.teardown.clone();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut out = BytesMut::with_capacity(READ_BUFFER_SIZE * 2);

        let outcome = loop {
            let read = tokio::select! {
                biased;
                _ = teardown.closed() => break PumpOutcome::Aborted,
                read = read_chunk(self.source.as_mut(), &mut buf) => read,
            };
            match read {
                Ok(0) => break PumpOutcome::EndOfStream,
                Ok(n) => {
                    if let Err(stop) = self.forward(&buf[..n], &mut out).await {
                        break stop;
                    }
                }
                Err(e) => break PumpOutcome::Failed(e),
            }
        };

        debug!(direction = %self.direction, "Pump stopped: {:?}", outcome);

        let stop_peer = match outcome {
            PumpOutcome::Failed(_) => true,
            PumpOutcome::EndOfStream => self.close_on_eof,
            PumpOutcome::Aborted => false,
        };
        if stop_peer && self.teardown.close() {
            debug!(direction = %self.direction, "Session teardown triggered");
        }

        self.close_sinks().await;

        PumpReport {
            direction: self.direction,
            outcome,
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
            corrections: self.corrections,
        }
    }

    /// 修正一段输入并按固定顺序写入所有输出
    ///
    /// 写入可以进行时总是先完成；输出阻塞期间会话被拆除则以 `Aborted` 结束。
    async fn forward(
        &mut self,
        input: &[u8],
        out: &mut BytesMut,
    ) -> std::result::Result<(), PumpOutcome> {
        self.bytes_read += input.len() as u64;

        out.clear();
        match self.corrector.as_mut() {
            Some(corrector) => {
                let injected = corrector.apply(input, out);
                if injected > 0 {
                    trace!(direction = %self.direction, "Injected {} correction byte(s)", injected);
                    self.corrections += injected as u64;
                }
            }
            None => out.extend_from_slice(input),
        }

        let teardown = self.teardown.clone();
        for sink in self.sinks.iter_mut() {
            let written = tokio::select! {
                biased;
                written = write_chunk(sink.as_mut(), &out[..]) => written,
                _ = teardown.closed() => return Err(PumpOutcome::Aborted),
            };
            written.map_err(|e| PumpOutcome::Failed(PumpError::Write(e)))?;
        }
        self.bytes_written += out.len() as u64;
        trace!(direction = %self.direction, "Relayed {} byte(s)", out.len());

        Ok(())
    }

    /// 尽力关闭所有输出，单个失败不影响其余输出
    async fn close_sinks(&mut self) {
        for (idx, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.shutdown().await {
                warn!(
                    direction = %self.direction,
                    "Failed to close sink #{}: {}", idx, e
                );
            }
        }
    }
}

/// 完整写入一段数据并刷新
async fn write_chunk(sink: &mut dyn ByteSink, data: &[u8]) -> io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}

/// 读取一段可用数据，`Interrupted` 时重试；源端结束时返回 0
async fn read_chunk(
    source: &mut dyn ByteSource,
    buf: &mut [u8],
) -> std::result::Result<usize, PumpError> {
    loop {
        match source.read(buf).await {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PumpError::Read(e)),
        }
    }
}
