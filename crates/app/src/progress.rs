use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use matching::ProgressReporter;
use std::sync::Arc;

pub struct IndicatifProgressReporter {
    bar: ProgressBar,
}

impl IndicatifProgressReporter {
    pub fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")?,
        );
        Ok(Self { bar })
    }

    pub fn get_reporter(&self) -> ProgressReporter {
        let bar = self.bar.clone();
        ProgressReporter::new(Arc::new(move |processed_count, total_count, text: &str| {
            if bar.length() != Some(total_count) {
                bar.set_length(total_count);
            }
            if bar.position() != processed_count {
                bar.set_position(processed_count);
            }
            bar.set_message(text.to_owned());
        }))
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}
