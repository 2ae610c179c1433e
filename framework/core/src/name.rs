use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha3::{Digest, Sha3_256};

use crate::error::ConfigurationError;

pub const DEFAULT_RESOURCE_NAME_FORMAT: &str = "s_cb_XXXXXXXX_XXXXXXXX";

const NAME_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A format like `prefix` `XXX...` `separator` `XXX...` `suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NameFormat {
    prefix: String,
    task_len: usize,
    separator: String,
    random_len: usize,
    suffix: String,
}

impl NameFormat {
    fn parse(format: &str) -> Result<Self, ConfigurationError> {
        let chars = format.chars().collect::<Vec<_>>();
        let invalid = || {
            ConfigurationError(format!(
                "resource name format '{format}' must contain two runs of at least three X \
                 separated by other characters"
            ))
        };
        let run_len = |start: usize| chars[start..].iter().take_while(|c| **c == 'X').count();

        let mut pos = 0;
        let task_start = loop {
            if pos >= chars.len() {
                return Err(invalid());
            }
            let run = run_len(pos);
            if run >= 3 {
                break pos;
            }
            pos += run.max(1);
        };
        let task_len = run_len(task_start);

        let separator_start = task_start + task_len;
        let separator_len = chars[separator_start..]
            .iter()
            .take_while(|c| **c != 'X')
            .count();
        if separator_len == 0 {
            return Err(invalid());
        }

        let random_start = separator_start + separator_len;
        let random_len = run_len(random_start);
        if random_len < 3 {
            return Err(invalid());
        }

        let collect = |from: usize, to: usize| chars[from..to].iter().collect::<String>();
        Ok(Self {
            prefix: collect(0, task_start),
            task_len,
            separator: collect(separator_start, random_start),
            random_len,
            suffix: collect(random_start + random_len, chars.len()),
        })
    }
}

fn random_string<R: Rng>(rng: &mut R, len: usize) -> String {
    (0..len)
        .filter_map(|_| NAME_CHARS.choose(rng))
        .map(|c| *c as char)
        .collect()
}

/// Generates resource names that embed the owning task so that leftovers can be found later.
#[derive(Debug, Clone)]
pub struct ResourceNameGenerator {
    format: NameFormat,
}

impl Default for ResourceNameGenerator {
    fn default() -> Self {
        Self {
            format: NameFormat {
                prefix: "s_cb_".to_string(),
                task_len: 8,
                separator: "_".to_string(),
                random_len: 8,
                suffix: String::new(),
            },
        }
    }
}

impl ResourceNameGenerator {
    pub fn new(format: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            format: NameFormat::parse(format)?,
        })
    }

    /// The part of a name derived from the task id.
    ///
    /// Uses the task id with dashes removed when it is long enough and only contains allowed
    /// characters, otherwise a random string seeded from the task id so it stays stable.
    pub fn task_part(&self, task_id: &str) -> String {
        let len = self.format.task_len;
        let compact = task_id.replace('-', "");
        if compact.len() >= len && compact.bytes().all(|b| NAME_CHARS.contains(&b)) {
            return compact[..len].to_string();
        }

        let seed: [u8; 32] = Sha3_256::digest(task_id.as_bytes()).into();
        random_string(&mut StdRng::from_seed(seed), len)
    }

    pub fn generate(&self, task_id: &str) -> String {
        let f = &self.format;
        format!(
            "{}{}{}{}{}",
            f.prefix,
            self.task_part(task_id),
            f.separator,
            random_string(&mut rand::thread_rng(), f.random_len),
            f.suffix
        )
    }

    /// Check whether `name` could have been generated by this format, optionally for a specific
    /// task. Without `exact`, trailing characters after the suffix are allowed.
    pub fn name_matches(&self, name: &str, task_id: Option<&str>, exact: bool) -> bool {
        let f = &self.format;
        let Some(rest) = name.strip_prefix(f.prefix.as_str()) else {
            return false;
        };

        if rest.len() < f.task_len || !rest.is_char_boundary(f.task_len) {
            return false;
        }
        let (task, rest) = rest.split_at(f.task_len);
        let task_ok = match task_id {
            Some(task_id) => task == self.task_part(task_id),
            None => task.bytes().all(|b| NAME_CHARS.contains(&b)),
        };
        if !task_ok {
            return false;
        }

        let Some(rest) = rest.strip_prefix(f.separator.as_str()) else {
            return false;
        };
        if rest.len() < f.random_len || !rest.is_char_boundary(f.random_len) {
            return false;
        }
        let (random, rest) = rest.split_at(f.random_len);
        if !random.bytes().all(|b| NAME_CHARS.contains(&b)) {
            return false;
        }

        if exact {
            rest == f.suffix
        } else {
            rest.starts_with(f.suffix.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TASK_ID: &str = "0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0";

    #[test]
    fn default_format_parses() {
        let parsed = ResourceNameGenerator::new(DEFAULT_RESOURCE_NAME_FORMAT).unwrap();
        assert_eq!(ResourceNameGenerator::default().format, parsed.format);
    }

    #[test]
    fn generated_names_embed_task_id() {
        let generator = ResourceNameGenerator::default();
        let name = generator.generate(TASK_ID);

        assert!(name.starts_with("s_cb_0f1e2d3c_"), "{name}");
        assert_eq!("s_cb_".len() + 8 + 1 + 8, name.len());
        assert!(generator.name_matches(&name, Some(TASK_ID), true));
        assert!(!generator.name_matches(&name, Some("another-task-id-entirely"), true));
    }

    #[test]
    fn short_task_ids_get_a_stable_seeded_part() {
        let generator = ResourceNameGenerator::default();

        let first = generator.task_part("t1");
        assert_eq!(8, first.len());
        assert_eq!(first, generator.task_part("t1"));
        assert_ne!(first, generator.task_part("t2"));
    }

    #[test]
    fn custom_format_with_suffix() {
        let generator = ResourceNameGenerator::new("bench-XXXX.XXXXXX.vm").unwrap();
        let name = generator.generate(TASK_ID);

        assert!(name.starts_with("bench-0f1e."), "{name}");
        assert!(name.ends_with(".vm"));
        assert!(generator.name_matches(&name, None, true));
        assert!(generator.name_matches(&format!("{name}-volume"), None, false));
        assert!(!generator.name_matches(&format!("{name}-volume"), None, true));
    }

    #[test]
    fn rejects_formats_without_two_runs() {
        for format in ["plain", "s_XXXXXXXX", "s_XX_XXXX", "XXXXXXXX"] {
            assert!(
                ResourceNameGenerator::new(format).is_err(),
                "{format} should be rejected"
            );
        }
    }

    #[test]
    fn short_x_runs_belong_to_the_prefix() {
        let generator = ResourceNameGenerator::new("aXX_XXX_XXX").unwrap();
        assert_eq!("aXX_", generator.format.prefix);
    }
}
