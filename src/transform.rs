use std::fs::File;
use std::io::Write;

use json_patch::jsonptr::Pointer;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::engine::PatchGenerator;
use crate::error::Error;
use crate::kind::{ResourceKind, Workload};
use crate::policy::EffectivePolicy;

const DOCUMENT_SEPARATOR: &[u8] = b"---\n";

enum InputSource {
    Stdin,
    File(File),
    Url(reqwest::Url),
}

pub struct Input {
    pub arg_number: usize,
    pub identifier: String,
    source: InputSource,
}

/// Resolves CLI arguments into inputs: `-` for stdin, http(s) URLs, or file paths.
/// Files are opened right away so a bad path fails before anything is written.
pub fn arguments_to_inputs(args: &[String]) -> Result<Vec<Input>, Error> {
    args.iter()
        .enumerate()
        .map(|(arg_number, arg)| {
            let source = if arg == "-" {
                InputSource::Stdin
            } else if arg.starts_with("http://") || arg.starts_with("https://") {
                let url = reqwest::Url::parse(arg).map_err(|e| Error::Input {
                    identifier: arg.clone(),
                    arg_number,
                    source: Box::new(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        e,
                    ))),
                })?;
                InputSource::Url(url)
            } else {
                let file = File::open(arg).map_err(|e| Error::Input {
                    identifier: arg.clone(),
                    arg_number,
                    source: Box::new(Error::Io(e)),
                })?;
                InputSource::File(file)
            };

            Ok(Input {
                arg_number,
                identifier: arg.clone(),
                source,
            })
        })
        .collect()
}

impl Input {
    async fn read_all(self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        match self.source {
            InputSource::Stdin => {
                tokio::io::stdin().read_to_end(&mut data).await?;
            }
            InputSource::File(file) => {
                tokio::fs::File::from_std(file).read_to_end(&mut data).await?;
            }
            InputSource::Url(url) => {
                let response = reqwest::get(url).await?.error_for_status()?;
                data = response.bytes().await?.to_vec();
            }
        }
        Ok(data)
    }
}

/// Splits a multi-document yaml stream on `---` lines. Separator lines may carry a
/// trailing comment; whitespace-only documents are dropped.
pub struct Documents<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Documents<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

fn is_separator(line: &[u8]) -> bool {
    let Some(rest) = line.strip_prefix(b"---") else {
        return false;
    };
    let rest = rest.trim_ascii();
    rest.is_empty() || rest.starts_with(b"#")
}

impl<'a> Iterator for Documents<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let start = self.pos;
            let mut end = start;

            while self.pos < self.data.len() {
                let line_end = self.data[self.pos..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(self.data.len(), |i| self.pos + i + 1);
                let line = &self.data[self.pos..line_end];
                self.pos = line_end;

                if is_separator(line) {
                    break;
                }
                end = line_end;
            }

            let document = &self.data[start..end];
            if !document.trim_ascii().is_empty() {
                return Some(document);
            }
        }
        None
    }
}

/// Offline transformer: applies the static policy to every supported document.
pub struct Transformer {
    config: PolicyConfig,
    policy: EffectivePolicy,
}

impl Transformer {
    pub fn new(config: PolicyConfig) -> Self {
        let policy = EffectivePolicy::from_config(&config);
        Self { config, policy }
    }

    /// Streams every input to `output`. Output already written is kept when a later
    /// document fails.
    pub async fn transform<W: Write>(&self, inputs: Vec<Input>, output: &mut W) -> Result<(), Error> {
        for (i, input) in inputs.into_iter().enumerate() {
            if i > 0 {
                output.write_all(DOCUMENT_SEPARATOR)?;
            }

            let identifier = input.identifier.clone();
            let arg_number = input.arg_number;
            let wrap = |e: Error| Error::Input {
                identifier: identifier.clone(),
                arg_number,
                source: Box::new(e),
            };

            let data = input.read_all().await.map_err(wrap)?;
            self.transform_stream(&data, &identifier, output).map_err(wrap)?;
        }
        output.flush()?;
        Ok(())
    }

    pub fn transform_stream<W: Write>(&self, data: &[u8], identifier: &str, output: &mut W) -> Result<(), Error> {
        for (i, document) in Documents::new(data).enumerate() {
            let transformed = self.transform_document(document)?;

            if i > 0 {
                output.write_all(DOCUMENT_SEPARATOR)?;
            }
            match transformed {
                Some(yaml) => output.write_all(yaml.as_bytes())?,
                None => {
                    warn!(input = %identifier, "unknown kind in input, writing to output as-is");
                    output.write_all(document)?;
                    if !document.ends_with(b"\n") {
                        output.write_all(b"\n")?;
                    }
                }
            }
        }
        Ok(())
    }

    /// `None` when the document is not an injectable kind.
    pub fn transform_document(&self, document: &[u8]) -> Result<Option<String>, Error> {
        let kind = ResourceKind::sniff(document)?;
        if !kind.is_known() {
            return Ok(None);
        }

        let mut value: Value = serde_yaml::from_slice(document)?;
        let workload = Workload::decode(&kind, &value)?;
        let patches = PatchGenerator::new(&self.config, &self.policy).generate(&workload, Pointer::root())?;
        debug!(kind = %kind, patches = patches.len(), "applying patches");

        json_patch::patch(&mut value, &patches)?;
        Ok(Some(serde_yaml::to_string(&value)?))
    }
}
