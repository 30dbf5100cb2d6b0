/// Format a millisecond duration as a fixed-width `HH:MM:SS` string.
///
/// Each field is zero-padded to two digits. Hours grow past 99 without
/// wrapping, so 25 hours renders as `25:00:00`.
pub fn format_hms(millis: u64) -> String {
    let total_secs = millis / 1_000;
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
