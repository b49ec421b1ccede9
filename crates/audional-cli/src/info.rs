//! Plain-text project summary

use std::fmt::Write;

use audional_core::{loop_duration, Channel, ProjectState, STEPS_PER_BEAT};

fn step_row(channel: &Channel) -> String {
    let steps = channel.steps();
    (0..steps.len())
        .map(|i| match (steps.is_lit(i), steps.is_reversed(i)) {
            (true, true) => 'r',
            (true, false) => 'x',
            _ => '.',
        })
        .collect()
}

fn channel_label(channel: &Channel) -> String {
    let source = match channel {
        Channel::Sampler(c) => format!("sample {}", c.selected_sample_index),
        Channel::Instrument(c) => match &c.instrument_id {
            Some(id) => format!("instrument {id}"),
            None => "instrument (unbound)".to_string(),
        },
    };
    let mix = channel.mix();
    let mut flags = String::new();
    if mix.mute {
        flags.push_str(" M");
    }
    if mix.solo {
        flags.push_str(" S");
    }
    if channel.name().is_empty() {
        format!("{source} vol {:.2}{flags}", mix.volume)
    } else {
        format!("{} ({source}) vol {:.2}{flags}", channel.name(), mix.volume)
    }
}

pub fn describe(project: &ProjectState) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} BPM, {} steps, {:.2}s per loop",
        project.bpm,
        project.step_count(),
        loop_duration(project.bpm, STEPS_PER_BEAT, project.step_count())
    );
    for (seq_idx, sequence) in project.sequences.iter().enumerate() {
        let marker = if seq_idx == project.current_sequence_index { "*" } else { " " };
        let _ = writeln!(out, "{marker}sequence {}", seq_idx + 1);
        for (ch_idx, channel) in sequence.channels.iter().enumerate() {
            let _ = writeln!(out, "  {:2} {} {}", ch_idx, step_row(channel), channel_label(channel));
        }
    }
    out
}
