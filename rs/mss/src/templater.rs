//! Expands the `{bitrate}` and `{start time}` placeholders in a track's
//! URL template. Both placeholders must appear, in that order; the search
//! for `{start time}` begins only after the first replacement so a bitrate
//! value that happens to contain the literal text `{start time}` cannot be
//! mistaken for the real placeholder.

use crate::error::{Error, Result};

const BITRATE_PLACEHOLDER: &str = "{bitrate}";
const START_TIME_PLACEHOLDER: &str = "{start time}";

pub struct UrlTemplater;

impl UrlTemplater {
    pub fn expand(template: &str, bit_rate: u64, start_ts: u64) -> Result<String> {
        let bitrate_pos = find_ci(template, BITRATE_PLACEHOLDER, 0)
            .ok_or_else(|| Error::manifest_invalid("url template missing {bitrate}"))?;

        let mut out = String::with_capacity(template.len() + 16);
        out.push_str(&template[..bitrate_pos]);
        out.push_str(&bit_rate.to_string());
        let after_bitrate = bitrate_pos + BITRATE_PLACEHOLDER.len();

        let start_time_pos = find_ci(template, START_TIME_PLACEHOLDER, after_bitrate)
            .ok_or_else(|| Error::manifest_invalid("url template missing {start time}"))?;

        out.push_str(&template[after_bitrate..start_time_pos]);
        out.push_str(&start_ts.to_string());
        let after_start_time = start_time_pos + START_TIME_PLACEHOLDER.len();
        out.push_str(&template[after_start_time..]);

        Ok(out)
    }
}

fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let haystack_lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    haystack_lower.get(from..)?.find(&needle_lower).map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_both_placeholders_in_order() {
        let url = UrlTemplater::expand("x/{bitrate}/{start time}", 1000, 42).unwrap();
        assert_eq!(url, "x/1000/42");
    }

    #[test]
    fn missing_start_time_is_manifest_invalid() {
        let err = UrlTemplater::expand("x/{bitrate}", 1000, 42).unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid(_)));
    }

    #[test]
    fn missing_bitrate_is_manifest_invalid() {
        let err = UrlTemplater::expand("x/{start time}", 1000, 42).unwrap_err();
        assert!(matches!(err, Error::ManifestInvalid(_)));
    }

    #[test]
    fn case_insensitive_placeholders() {
        let url = UrlTemplater::expand("x/{BitRate}/{Start Time}", 7, 9).unwrap();
        assert_eq!(url, "x/7/9");
    }

    #[test]
    fn real_world_template() {
        let url = UrlTemplater::expand("Video({bitrate},{start time}).mp4", 500_000, 20_000_000).unwrap();
        assert_eq!(url, "Video(500000,20000000).mp4");
    }
}
