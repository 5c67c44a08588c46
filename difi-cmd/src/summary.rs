use std::io::{stdout, Write};

use anyhow::{Context, Result};
use difi::pipeline::RunSummary;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

pub fn print(summary: &RunSummary, format: &Format) -> Result<()> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), summary).context("serializing to json")?;
            println!();
            Ok(())
        }
        Format::Text => {
            let data = render_text(summary).context("serializing summary")?;
            stdout()
                .write_all(str::as_bytes(&data))
                .context("writing to stdout")
        }
    }
}

fn render_text(summary: &RunSummary) -> Result<String> {
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_template_string("summary", TEXT_TEMPLATE)
        .context("parsing summary template")?;

    hb.render("summary", summary).context("rendering text")
}

const TEXT_TEMPLATE: &str = r"Stopped:   {{ stop_reason }}
-------------------------------------------------------------------------------
Datagrams: {{ datagrams }}
Skipped:   {{ skipped }}
Aligned:   {{ totals.aligned_away }}
Lost:      {{ totals.lost }}
Dropped:   {{ incomplete }}
Packets:   {{ totals.packets }}
Samples:   {{ totals.samples }}
Frames:    {{ frames_written }}
Bytes:     {{ bytes_written }}
{{ #if context }}Rate:      {{ context.sample_rate }}
Frequency: {{ context.rf_freq }}
{{ /if }}{{ #if teardown_failed }}WARNING: ring buffer was not released cleanly
{{ /if }}";
