//! Instruction blocks sent to the conversational AI at phase boundaries.

use serde::{Deserialize, Serialize};

const TOPICS_PLACEHOLDER: &str = "{{specific_topics}}";
const TOPIC_PLACEHOLDER: &str = "{{specific_topic}}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    /// Opening of part one. `{{specific_topics}}` is replaced with the
    /// paper's warm-up topics.
    pub part1_opening: String,
    pub last_turn: String,
    /// Opening of part two. `{{specific_topic}}` is replaced with the
    /// paper's task-card topic.
    pub part2_opening: String,
    pub time_up: String,
    pub part3_opening: String,
    pub analysis: String,
}

impl PromptSet {
    pub fn part1(&self, warm_up_topics: &[String]) -> String {
        self.part1_opening
            .replace(TOPICS_PLACEHOLDER, &warm_up_topics.join(", "))
    }

    pub fn part2(&self, topic: &str) -> String {
        self.part2_opening.replace(TOPIC_PLACEHOLDER, topic)
    }

    pub(crate) fn system(text: &str) -> String {
        format!("[system_prompt]{text}[/system_prompt]")
    }
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            part1_opening: Self::system(
                "You are the examiner of an oral English exam. Start part one: greet the \
                 candidate and ask one short question about {{specific_topics}}. Ask one \
                 question per turn.",
            ),
            last_turn: Self::system(
                "Last turn. Reply briefly and then send the signal \
                 [last_turn_ends][/last_turn_ends].",
            ),
            part2_opening: Self::system(
                "Start part two on the topic {{specific_topic}}. Write a task card wrapped in \
                 [task_card][/task_card] and a short instruction telling the candidate they \
                 have one minute to prepare, wrapped in [begin_word][/begin_word].",
            ),
            time_up: Self::system("Time is up"),
            part3_opening: Self::system(
                "Start part three. Discuss more abstract questions related to the part two \
                 topic, one question per turn.",
            ),
            analysis: Self::system(
                "The exam is over. Analyse the candidate's performance across all parts and \
                 wrap your feedback in [feedback][/feedback].",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_topic_placeholders() {
        let prompts = PromptSet {
            part1_opening: "topics: {{specific_topics}}".into(),
            part2_opening: "topic: {{specific_topic}}".into(),
            ..PromptSet::default()
        };
        let topics = vec!["hometown".to_string(), "music".to_string()];
        assert_eq!(prompts.part1(&topics), "topics: hometown, music");
        assert_eq!(prompts.part2("a memorable trip"), "topic: a memorable trip");
    }
}
