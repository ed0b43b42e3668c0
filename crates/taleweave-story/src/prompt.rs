//! Building generation requests from a session snapshot.

use std::collections::BTreeSet;

use serde_json::json;
use taleweave_arbiter::TemplateVars;
use taleweave_protocol::InputCounts;
use taleweave_session::{Contribution, SegmentDraft, Session};

/// Next segment when nobody sent a direct input this round.
pub const CONTINUATION_TEMPLATE: &str = "story_continuation";
/// Next segment built around participants' direct inputs.
pub const PLAYER_INPUT_TEMPLATE: &str = "story_with_player_input";
/// The closing segment, written with the whole story in view.
pub const CONCLUSION_TEMPLATE: &str = "story_conclusion";

/// Which kind of segment a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Segment,
    Conclusion,
}

/// Everything needed to issue one generation request and to record its
/// result.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptPlan {
    pub kind: RequestKind,
    pub template: &'static str,
    pub variables: TemplateVars,
    /// Names of participants whose inputs went into this request.
    pub contributors: BTreeSet<String>,
    pub inputs: InputCounts,
}

impl PromptPlan {
    /// The segment to append once the backend returns `text`.
    pub fn draft(&self, text: String) -> SegmentDraft {
        SegmentDraft {
            text,
            template: self.template.to_string(),
            contributors: self.contributors.clone(),
            inputs: self.inputs,
            conclusion: self.kind == RequestKind::Conclusion,
        }
    }
}

/// Builds the request for the next segment of `session`.
///
/// Regular segments see the seed premise plus the last few segments; the
/// conclusion sees the whole story. Inputs are attributed as
/// `[Name]: text`, one per line.
pub fn build_prompt(session: &Session, kind: RequestKind) -> PromptPlan {
    let pending = &session.pending;
    let template = match kind {
        RequestKind::Conclusion => CONCLUSION_TEMPLATE,
        RequestKind::Segment if !pending.direct.is_empty() => PLAYER_INPUT_TEMPLATE,
        RequestKind::Segment => CONTINUATION_TEMPLATE,
    };

    let story_context = match kind {
        RequestKind::Segment => session.recent_context.join("\n\n"),
        RequestKind::Conclusion => session
            .segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    };
    let segment_number = match kind {
        RequestKind::Segment => json!(session.numbered_segment_count() + 1),
        RequestKind::Conclusion => json!("conclusion"),
    };
    let players: Vec<&str> = session
        .participants_in_join_order()
        .into_iter()
        .filter(|p| p.connected)
        .map(|p| p.name.as_str())
        .collect();

    let mut variables = TemplateVars::new();
    variables.insert("seed_text".into(), json!(session.seed_text()));
    variables.insert("story_context".into(), json!(story_context));
    variables.insert("direct_inputs".into(), json!(attributed(&pending.direct)));
    variables.insert("influence_inputs".into(), json!(attributed(&pending.influence)));
    variables.insert("segment_number".into(), segment_number);
    variables.insert("players".into(), json!(players.join(", ")));

    let contributors = pending
        .direct
        .iter()
        .chain(&pending.influence)
        .map(|c| c.name.clone())
        .collect();

    PromptPlan {
        kind,
        template,
        variables,
        contributors,
        inputs: pending.counts(),
    }
}

fn attributed(inputs: &[Contribution]) -> String {
    inputs
        .iter()
        .map(|c| format!("[{}]: {}", c.name, c.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use taleweave_protocol::{ContributionKind, ParticipantId, SegmentNumber};
    use taleweave_session::{CleanupPolicy, SessionRegistry, StoryConfig};

    use super::*;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    /// An active session with a seed, hosted by "Host" with "Ada" joined.
    fn registry() -> (SessionRegistry, taleweave_protocol::SessionId) {
        let mut registry = SessionRegistry::new(StoryConfig::default(), CleanupPolicy::default());
        let (id, _rx) = registry.create_session(pid("host"), "Host", "test").unwrap();
        registry.join_session(&id, pid("ada"), "Ada", "test").unwrap();
        registry
            .add_input(&id, &pid("host"), ContributionKind::Seed, "A lighthouse")
            .unwrap();
        registry.start_story(&id).unwrap();
        (registry, id)
    }

    fn segment(text: &str) -> SegmentDraft {
        SegmentDraft {
            text: text.into(),
            template: CONTINUATION_TEMPLATE.into(),
            contributors: BTreeSet::new(),
            inputs: InputCounts::default(),
            conclusion: false,
        }
    }

    #[test]
    fn test_build_prompt_without_direct_inputs_uses_continuation() {
        let (mut registry, id) = registry();
        registry
            .add_input(&id, &pid("ada"), ContributionKind::Influence, "make it spooky")
            .unwrap();

        let plan = build_prompt(registry.get(&id).unwrap(), RequestKind::Segment);

        assert_eq!(plan.template, CONTINUATION_TEMPLATE);
        assert_eq!(plan.variables["influence_inputs"], "[Ada]: make it spooky");
        assert_eq!(plan.variables["direct_inputs"], "");
        assert_eq!(plan.variables["seed_text"], "A lighthouse");
        assert_eq!(plan.variables["segment_number"], 1);
        assert_eq!(plan.variables["players"], "Host, Ada");
        assert_eq!(plan.inputs, InputCounts { direct: 0, influence: 1 });
    }

    #[test]
    fn test_build_prompt_with_direct_inputs_attributes_them() {
        let (mut registry, id) = registry();
        registry
            .add_input(&id, &pid("host"), ContributionKind::Direct, "The lamp goes out")
            .unwrap();
        registry
            .add_input(&id, &pid("ada"), ContributionKind::Direct, "A bell rings")
            .unwrap();

        let plan = build_prompt(registry.get(&id).unwrap(), RequestKind::Segment);

        assert_eq!(plan.template, PLAYER_INPUT_TEMPLATE);
        assert_eq!(
            plan.variables["direct_inputs"],
            "[Host]: The lamp goes out\n[Ada]: A bell rings"
        );
        assert_eq!(
            plan.contributors,
            BTreeSet::from(["Ada".to_string(), "Host".to_string()])
        );
    }

    #[test]
    fn test_build_prompt_context_is_bounded_but_conclusion_sees_everything() {
        let mut registry = SessionRegistry::new(StoryConfig::default(), CleanupPolicy::default());
        let mut config = StoryConfig::default();
        config.context_segments = 1;
        let (id, _rx) = registry
            .create_session_with(pid("host"), "Host", "test", config)
            .unwrap();
        registry.start_story(&id).unwrap();
        registry.append_segment(&id, segment("one")).unwrap();
        registry.append_segment(&id, segment("two")).unwrap();
        let session = registry.get(&id).unwrap();

        let next = build_prompt(session, RequestKind::Segment);
        let end = build_prompt(session, RequestKind::Conclusion);

        assert_eq!(next.variables["story_context"], "two");
        assert_eq!(next.variables["segment_number"], 3);
        assert_eq!(end.template, CONCLUSION_TEMPLATE);
        assert_eq!(end.variables["story_context"], "one\n\ntwo");
        assert_eq!(end.variables["segment_number"], "conclusion");
    }

    #[test]
    fn test_draft_marks_conclusion() {
        let (registry, id) = registry();
        let plan = build_prompt(registry.get(&id).unwrap(), RequestKind::Conclusion);
        let draft = plan.draft("The end.".into());
        assert!(draft.conclusion);
        assert_eq!(draft.template, CONCLUSION_TEMPLATE);

        let mut registry = registry;
        let segment = registry.append_segment(&id, draft).unwrap();
        assert_eq!(segment.sequence, SegmentNumber::Conclusion);
    }
}
