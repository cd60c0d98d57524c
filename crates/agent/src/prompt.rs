//! The system prompt sent with every generation step.

use chrono::{DateTime, Utc};

const GUIDANCE: &str = "\
## Available Tools (use them in this order)

1. **search_web** - search the web for relevant pages
2. **scrape_pages** - fetch the full content of pages found by the search

## Instructions
- Always call scrape_pages on 4-6 diverse URLs from the search results
- Mix source types: news, official documentation, academic papers, expert blogs, forums
- Prefer recent sources when the user asks for current or latest information
- Check publication dates and mention them in your answer
- If some pages could not be fetched, work with what succeeded and say what is missing

## Formatting
- Cite sources inline as markdown links using the page title as link text
- Never print raw URLs
- Include publication dates when known: [title](url) (Published: date)
";

/// Build the system prompt for a turn starting at `now`.
///
/// An `override_prompt` replaces the built-in guidance; the current date is
/// always prepended so the model can judge recency.
pub fn system_prompt(override_prompt: Option<&str>, now: DateTime<Utc>) -> String {
    let date = now.format("%A, %B %-d, %Y %H:%M UTC");
    match override_prompt {
        Some(custom) => format!("The current date and time is {date}.\n\n{custom}"),
        None => format!(
            "You are a helpful AI assistant that can search the web and scrape websites \
             to provide accurate and up-to-date information.\n\n\
             ## Current Date and Time\nThe current date and time is {date}.\n\n{GUIDANCE}"
        ),
    }
}
