use weft_core::types::{ChannelTag, ChatId, UserId};
use weft_skills::SkillDescriptor;
use weft_tasks::WindowEntry;

/// Everything an agent needs to answer one task iteration.
///
/// Assembled by the orchestrator from the task record, the user's memory
/// fragments, and the skill registry. Agents are stateless — the context is
/// the whole input.
#[derive(Clone)]
pub struct TaskContext {
    pub user_id: UserId,
    pub channel: ChannelTag,
    pub chat_id: ChatId,
    /// Short-term conversation window, oldest first. The final entry is the
    /// current user message.
    pub window: Vec<WindowEntry>,
    /// User-scoped memory fragments in fixed order: the compressed summary
    /// first, then the free-form data block.
    pub memory: Vec<String>,
    /// Skills available this turn. Empty disables the tool face entirely.
    pub skills: Vec<SkillDescriptor>,
}
