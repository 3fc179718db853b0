//! Context briefing text for a session.

use crate::memory_db::{ChannelMemoryEntry, GlobalKnowledgeEntry, WorkItem, WorkStatus};

/// Render the sections that have content, in the order global knowledge,
/// channel context, active work. Returns an empty string when all are empty.
pub fn render_briefing(
    global: &[GlobalKnowledgeEntry],
    channel: &[ChannelMemoryEntry],
    work: &[WorkItem],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !global.is_empty() {
        let mut lines = vec!["## Global Knowledge".to_string()];
        lines.extend(
            global
                .iter()
                .map(|entry| format!("- [{}] {} (from {})", entry.category, entry.content, entry.source_channel)),
        );
        sections.push(lines.join("\n"));
    }

    if !channel.is_empty() {
        let mut lines = vec!["## Channel Context".to_string()];
        lines.extend(
            channel
                .iter()
                .map(|memory| format!("- [{}] {}", memory.memory_type, memory.content)),
        );
        sections.push(lines.join("\n"));
    }

    if !work.is_empty() {
        let mut lines = vec!["## Active Work".to_string()];
        lines.extend(
            work.iter()
                .map(|item| format!("- [{}] {}", work_label(item), item.description)),
        );
        sections.push(lines.join("\n"));
    }

    sections.join("\n\n")
}

fn work_label(item: &WorkItem) -> String {
    match item.status {
        WorkStatus::Executing => format!("RUNNING {}%", item.progress_pct),
        other => other.as_str().to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::from_millis;

    fn knowledge(content: &str) -> GlobalKnowledgeEntry {
        GlobalKnowledgeEntry {
            id: 1,
            category: "decision".into(),
            content: content.into(),
            confidence: 0.9,
            source_channel: "discord".into(),
            source_session_key: "agent:main:parallel:discord".into(),
            source_memory_id: Some(1),
            created_at: from_millis(0),
        }
    }

    fn work(description: &str, status: WorkStatus, progress_pct: u8) -> WorkItem {
        WorkItem {
            id: 1,
            session_key: "agent:main:parallel:discord".into(),
            channel_id: "discord".into(),
            description: description.into(),
            payload: serde_json::Value::Null,
            priority: 5,
            status,
            scheduled_for: None,
            attempts: 0,
            max_attempts: 3,
            progress_pct,
            result_summary: None,
            created_at: from_millis(0),
            updated_at: from_millis(0),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn empty_inputs_render_nothing() {
        assert_eq!(render_briefing(&[], &[], &[]), "");
    }

    #[test]
    fn sections_appear_in_order() {
        let text = render_briefing(
            &[knowledge("ship on tuesdays")],
            &[],
            &[work("summarize thread", WorkStatus::Executing, 40), work("digest", WorkStatus::Ready, 0)],
        );
        assert_eq!(
            text,
            "## Global Knowledge\n- [decision] ship on tuesdays (from discord)\n\n\
             ## Active Work\n- [RUNNING 40%] summarize thread\n- [READY] digest"
        );
        assert!(!text.contains("Channel Context"));
    }
}
