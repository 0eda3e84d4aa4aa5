//! Final prompt assembly: profile header first, then the task.

use crate::profile::Profile;

/// Prepend the child profile header to a task prompt.
///
/// Names are always included. Age and traits are phrased as guidance the
/// story must follow, not facts to repeat. The active situation is included
/// only when `include_context` is set; standing wishes whenever present.
pub fn build_story_prompt(profile: &Profile, task: &str, include_context: bool) -> String {
    let mut header = vec![
        "Child profile (use it to shape the story):".to_string(),
        format!(
            "- Main characters: {}. Use exactly these names for the heroes.",
            profile.child_names.trim()
        ),
    ];

    let age = profile.age.trim();
    if !age.is_empty() {
        header.push(format!(
            "- Age: {age}. Match vocabulary, length, and themes to this age; \
             do not mention the age in the story."
        ));
    }

    if profile.has_traits() {
        header.push(format!(
            "- Character: {}. Show this through what the heroes do; \
             never list these traits word for word.",
            profile.traits.trim()
        ));
    }

    if include_context {
        if let Some(context) = profile.active_context() {
            header.push(format!(
                "- Current situation: {context}. The fable should help the child with it \
                 and end with a clear moral."
            ));
        }
    }

    if let Some(wishes) = profile.wishes() {
        header.push(format!("- Parent's wishes for every story: {wishes}"));
    }

    format!("{}\n\nTask:\n{}", header.join("\n"), task.trim())
}
