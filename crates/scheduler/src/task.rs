use async_trait::async_trait;
use history_core::HistoryError;

/// 调度器可执行的任务
///
/// 提交后所有权归调度器, 直到 `on_success` 或 `on_failure` 被调用。
/// 同一 `ordering_key` 的任务按提交顺序执行和回调。
#[async_trait]
pub trait SchedulableTask: Send + Sync + 'static {
    /// 数字越小优先级越高
    fn priority(&self) -> u8;

    fn ordering_key(&self) -> String;

    /// 已重试次数, 首次执行为 0
    fn attempt(&self) -> u32;

    fn increment_attempt(&mut self);

    /// 分片已不再归本机所有时返回 true, 此后任务不会再被执行或重试
    fn is_cancelled(&self) -> bool {
        false
    }

    async fn execute(&self) -> Result<(), HistoryError>;

    fn should_retry(&self, error: &HistoryError) -> bool {
        error.is_retryable()
    }

    fn on_success(self: Box<Self>);

    fn on_failure(self: Box<Self>, error: HistoryError);
}
