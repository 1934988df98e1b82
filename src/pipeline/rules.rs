//! Relevance classification rules.
//!
//! A [`RuleTable`] is an immutable, versioned list of weighted keyword groups.
//! Classification is a pure function of (text, table):
//! - each distinct matched phrase adds its group's weight
//! - the negative group subtracts and is tracked separately
//! - guardrails can force the score to zero for known false-positive shapes
//!
//! Extending the table returns a new version and leaves the original untouched.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Serialize;
use tracing::debug;

use crate::error::ValidationError;
use crate::pipeline::matcher::{contains_phrase, matched_phrases, normalize, normalize_phrases};

/// Version of the built-in rule table.
pub const CLASSIFIER_VERSION: &str = "1.0.0";

/// Minimum (rounded) score for a relevant verdict.
pub const RELEVANCE_THRESHOLD: f64 = 0.7;

/// Role a keyword group plays in scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Technical signal; corroborates relevance on its own.
    Technical,
    /// Only meaningful alongside technical content (e.g. remote work).
    ContextOnly,
    /// Non-technical job signal; subtracts.
    Negative,
}

/// Post-hoc override that forced the score to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Guardrail {
    /// Context-only groups were the only positive signal.
    ContextOnly,
    /// A positive word only appeared inside a non-technical phrase.
    NegativePhrase,
    /// Negative match with no technical match at all.
    NegativeUncorroborated,
}

/// A named, weighted list of phrases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordGroup {
    pub name: String,
    /// Human-readable reason label; empty for the negative group.
    pub label: String,
    pub weight: f64,
    pub kind: GroupKind,
    phrases: Vec<String>,
}

impl KeywordGroup {
    /// Phrases are lowercased, whitespace-collapsed and de-duplicated.
    pub fn new<I, S>(name: &str, label: &str, weight: f64, kind: GroupKind, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            weight,
            kind,
            phrases: normalize_phrases(phrases),
        }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::InvalidRule("group name is empty".into()));
        }
        if self.phrases.is_empty() {
            return Err(ValidationError::InvalidRule(format!(
                "group {} has no phrases",
                self.name
            )));
        }
        let sign_ok = match self.kind {
            GroupKind::Negative => self.weight < 0.0,
            GroupKind::Technical | GroupKind::ContextOnly => self.weight > 0.0,
        };
        if !self.weight.is_finite() || !sign_ok {
            return Err(ValidationError::InvalidRule(format!(
                "group {} has weight {} which does not fit kind {:?}",
                self.name, self.weight, self.kind
            )));
        }
        Ok(())
    }
}

/// Structured explanation stored alongside a verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationMetadata {
    pub classifier_version: String,
    /// Positive groups with at least one match, in table order.
    pub matched_groups: Vec<String>,
    /// Matched phrases per group, including the negative group.
    pub matched_phrases: BTreeMap<String, Vec<String>>,
    /// Weight contribution per positive group.
    pub group_scores: BTreeMap<String, f64>,
    pub negative_matches: Vec<String>,
    pub positive_score: f64,
    pub negative_score: f64,
    pub guardrail_triggered: bool,
    pub guardrail: Option<Guardrail>,
}

/// Verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub relevant: bool,
    /// Rounded to two decimals.
    pub score: f64,
    pub reasons: Vec<String>,
    pub metadata: ClassificationMetadata,
}

/// Immutable, versioned keyword table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleTable {
    version: u32,
    groups: Vec<KeywordGroup>,
}

static BUILTIN: LazyLock<RuleTable> = LazyLock::new(RuleTable::builtin);

/// Classify against the built-in table.
pub fn classify(text: &str) -> Classification {
    BUILTIN.classify(text)
}

impl RuleTable {
    /// The built-in English table (version 1).
    pub fn builtin() -> Self {
        use GroupKind::{ContextOnly, Negative, Technical};

        let groups = vec![
            KeywordGroup::new("tech_core_high", "Software/IT development", 1.0, Technical, TECH_CORE),
            KeywordGroup::new("automation_high", "Automation/scripting", 1.0, Technical, AUTOMATION),
            KeywordGroup::new("devops_high", "DevOps/cloud", 1.0, Technical, DEVOPS),
            KeywordGroup::new("ai_ml_high", "AI/ML", 1.0, Technical, AI_ML),
            KeywordGroup::new("security_high", "Security", 1.0, Technical, SECURITY),
            KeywordGroup::new("it_support_mid", "IT support", 0.7, Technical, IT_SUPPORT),
            KeywordGroup::new("remote_low", "Remote work", 0.2, ContextOnly, REMOTE),
            KeywordGroup::new("negative_nontech", "", -1.0, Negative, NEGATIVE_NONTECH),
        ];
        Self { version: 1, groups }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Version string recorded with every classification made by this table.
    pub fn classifier_version(&self) -> String {
        if self.version <= 1 {
            CLASSIFIER_VERSION.to_string()
        } else {
            format!("{CLASSIFIER_VERSION}-r{}", self.version)
        }
    }

    pub fn groups(&self) -> &[KeywordGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&KeywordGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// New table version with `phrase` added to `group`.
    pub fn with_phrase(&self, group: &str, phrase: &str) -> Result<Self, ValidationError> {
        let phrase = normalize(phrase);
        if phrase.is_empty() {
            return Err(ValidationError::InvalidRule("phrase is empty".into()));
        }

        let mut next = self.clone();
        let target = next
            .groups
            .iter_mut()
            .find(|g| g.name == group)
            .ok_or_else(|| ValidationError::InvalidRule(format!("unknown group {group}")))?;
        if target.phrases.contains(&phrase) {
            return Err(ValidationError::InvalidRule(format!(
                "phrase '{phrase}' already in group {group}"
            )));
        }
        target.phrases.push(phrase);
        next.version += 1;
        debug!(group, version = next.version, "Rule table extended");
        Ok(next)
    }

    /// New table version with an additional group appended.
    pub fn with_group(&self, group: KeywordGroup) -> Result<Self, ValidationError> {
        group.validate()?;
        if self.group(&group.name).is_some() {
            return Err(ValidationError::InvalidRule(format!(
                "group {} already exists",
                group.name
            )));
        }
        let mut next = self.clone();
        next.groups.push(group);
        next.version += 1;
        Ok(next)
    }

    /// Score `text` and explain the verdict. Never mutates the table.
    pub fn classify(&self, text: &str) -> Classification {
        let haystack = normalize(text);

        let mut matched_groups = Vec::new();
        let mut phrases_by_group = BTreeMap::new();
        let mut group_scores = BTreeMap::new();
        let mut negative_matches: Vec<String> = Vec::new();
        let mut positive_score = 0.0;
        let mut negative_score = 0.0;
        let mut technical: Vec<&KeywordGroup> = Vec::new();
        let mut context_only: Vec<&KeywordGroup> = Vec::new();
        let mut positive_phrases: Vec<&str> = Vec::new();

        for group in &self.groups {
            let hits = matched_phrases(&haystack, &group.phrases);
            if hits.is_empty() {
                continue;
            }
            let contribution = group.weight * hits.len() as f64;
            phrases_by_group.insert(
                group.name.clone(),
                hits.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            );

            match group.kind {
                GroupKind::Negative => {
                    negative_score += contribution;
                    negative_matches.extend(hits.iter().map(|p| p.to_string()));
                }
                GroupKind::Technical | GroupKind::ContextOnly => {
                    positive_score += contribution;
                    group_scores.insert(group.name.clone(), round2(contribution));
                    matched_groups.push(group.name.clone());
                    positive_phrases.extend(hits.iter().copied());
                    if group.kind == GroupKind::Technical {
                        technical.push(group);
                    } else {
                        context_only.push(group);
                    }
                }
            }
        }

        let guardrail = if technical.is_empty() && !context_only.is_empty() {
            Some(Guardrail::ContextOnly)
        } else if technical.len() < 2
            && negative_phrase_overrides(&negative_matches, &positive_phrases)
        {
            Some(Guardrail::NegativePhrase)
        } else if technical.is_empty() && !negative_matches.is_empty() {
            Some(Guardrail::NegativeUncorroborated)
        } else {
            None
        };

        let score = match guardrail {
            Some(_) => 0.0,
            None => round2((positive_score + negative_score).max(0.0)),
        };

        let mut reasons: Vec<String> = Vec::new();
        let context: &[&KeywordGroup] = if technical.is_empty() {
            &[]
        } else {
            &context_only
        };
        for group in technical.iter().chain(context) {
            if !group.label.is_empty() && !reasons.contains(&group.label) {
                reasons.push(group.label.clone());
            }
        }

        Classification {
            relevant: score >= RELEVANCE_THRESHOLD,
            score,
            reasons,
            metadata: ClassificationMetadata {
                classifier_version: self.classifier_version(),
                matched_groups,
                matched_phrases: phrases_by_group,
                group_scores,
                negative_matches,
                positive_score: round2(positive_score),
                negative_score: round2(negative_score),
                guardrail_triggered: guardrail.is_some(),
                guardrail,
            },
        }
    }
}

/// A multi-word negative phrase that contains a matched single-word positive phrase.
fn negative_phrase_overrides(negative_matches: &[String], positive_phrases: &[&str]) -> bool {
    negative_matches
        .iter()
        .filter(|n| n.contains(' '))
        .any(|n| {
            positive_phrases
                .iter()
                .filter(|p| !p.contains(' '))
                .any(|p| contains_phrase(n, p))
        })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ── Built-in keyword lists ──────────────────────────────────────────

const TECH_CORE: &[&str] = &[
    "software", "developer", "programmer", "engineer", "coding", "coder", "full stack",
    "full-stack", "backend", "back-end", "front-end", "frontend", "web app", "webapp",
    "web development", "website", "api", "microservice", "micro-service", "soa",
    "service oriented", "database", "db", "sql", "postgresql", "postgres", "psql", "mongodb",
    "mysql", "oracle", "database admin", "dba", "data engineer", "software engineer",
    "application developer", "app developer", "web developer", "webdev", "mobile developer",
    "ios", "android", "react", "angular", "vue", "django", "flask", "spring", "spring boot",
    ".net", "dotnet", "java", "c++", "c#", "c sharp", "python", "ruby", "php", "laravel",
    "symfony", "express", "nodejs", "node.js", "javascript", "typescript", "go", "golang",
    "rust", "swift", "kotlin", "scala", "server-side", "serverside", "backend dev",
    "backend development", "rest", "restful", "rest api", "graphql", "grpc", "soap",
    "web service", "web services", "client-server", "mvc", "mvp", "sql developer",
    "database developer", "data modelling", "data modeling", "nosql", "newsql",
    "document database", "relational database", "query optimization", "database design",
    "data architecture", "architecture", "software architecture", "system design",
    "technical design", "design patterns", "solid", "clean code", "agile", "scrum", "kanban",
];

const AUTOMATION: &[&str] = &[
    "automation", "automate", "automated", "automating", "script", "scripting", "scripts",
    "scripting language", "python", "node", "nodejs", "node.js", "javascript", "js",
    "typescript", "bash", "shell", "shell scripting", "shell script", "powershell",
    "windows scripting", "cron", "scheduler", "scheduling", "scheduled task", "etl",
    "extract transform load", "data pipeline", "workflow", "work-flow", "pipeline",
    "pipelining", "orchestration", "orchestrator", "airflow", "dag", "directed acyclic graph",
    "bot", "chatbot", "telegram bot", "discord bot", "webhook", "webhooks", "api integration",
    "integration", "integrations", "rpa", "robotic process automation", "macros", "macro",
    "automation engineer", "automation specialist", "interpreted language", "dynamic language",
    "continuous integration", "ci", "continuous delivery", "cd", "build automation",
    "deployment automation", "release automation", "data processing", "batch processing",
    "stream processing", "event-driven", "event driven",
];

const DEVOPS: &[&str] = &[
    "devops", "site reliability engineer", "sre", "ci/cd", "cicd", "ci cd",
    "continuous integration", "continuous deployment", "continuous delivery",
    "infrastructure as code", "iaac", "docker", "container", "containers", "containerization",
    "kubernetes", "k8s", "kubernetes cluster", "k8s cluster", "container orchestration", "pod",
    "deployment", "deploying", "helm", "chart", "kompose", "docker compose", "aws",
    "amazon web services", "ec2", "s3", "lambda", "gcp", "google cloud", "gke",
    "google kubernetes engine", "azure", "microsoft azure", "aks", "azure kubernetes service",
    "cloud computing", "cloud native", "serverless", "function as a service", "faas",
    "terraform", "ansible", "chef", "puppet", "saltstack", "cloudformation", "arm template",
    "linux", "unix", "unix-like", "posix", "windows server", "windows admin", "system admin",
    "red hat", "rhel", "centos", "ubuntu", "debian", "server", "servers", "infrastructure",
    "infra", "deploy", "release engineering", "version control", "git", "gitlab", "github",
    "bitbucket", "vcs", "configuration management", "configuration", "config management",
    "monitoring", "logging", "observability", "metrics", "alerting", "prometheus", "grafana",
    "elk", "elk stack", "splunk", "network", "networking", "cdn", "content delivery network",
    "load balancer", "reverse proxy", "nginx", "apache", "scaling", "scalability",
    "horizontal scaling", "vertical scaling", "high availability", "ha", "disaster recovery",
    "dr",
];

const AI_ML: &[&str] = &[
    "ai", "artificial intelligence", "machine intelligence", "ml", "machine learning",
    "statistical learning", "llm", "large language model", "language model", "gpt", "chatgpt",
    "gpt-4", "claude", "gemini", "bard", "openai", "anthropic", "google ai", "hugging face",
    "prompt", "prompting", "prompt engineering", "prompt design", "in-context learning",
    "few-shot", "zero-shot", "fine-tuning", "training", "inference", "model deployment", "nlp",
    "natural language processing", "text analytics", "text mining", "sentiment analysis",
    "text classification", "named entity recognition", "ner", "part of speech tagging",
    "pos tagging", "tokenization", "embedding", "word embeddings", "vector embeddings",
    "transformer", "transformers", "attention mechanism", "self-attention", "bert", "roberta",
    "t5", "llama", "mistral", "phi", "computer vision", "cv", "image processing",
    "image recognition", "object detection", "object recognition", "image classification",
    "segmentation", "semantic segmentation", "instance segmentation", "face recognition", "ocr",
    "optical character recognition", "video analysis", "video processing", "agent", "agents",
    "ai agent", "autonomous agent", "multi-agent system", "multiagent", "swarm intelligence",
    "reinforcement learning", "rl", "deep rl", "q-learning", "data science", "data scientist",
    "data analytics", "data analysis", "big data", "data engineering", "data pipeline", "etl",
    "pandas", "numpy", "scipy", "scikit-learn", "sklearn", "matplotlib", "jupyter", "notebook",
    "colab", "kaggle", "tensorflow", "tf", "keras", "pytorch", "torch", "caffe", "mxnet",
    "theano", "cntk", "neural network", "neural net", "deep learning", "dl", "deepnet", "cnn",
    "rnn", "lstm", "gru", "gan", "generative", "discriminative", "backpropagation",
    "gradient descent", "optimization", "recommendation system", "recommender",
    "personalization", "search engine", "information retrieval", "ranking", "chatbot",
    "conversational ai", "virtual assistant", "voice assistant", "speech recognition",
    "speech to text", "text to speech", "tts", "generative ai", "genai", "text generation",
    "image generation", "foundation model", "pretrained", "transfer learning",
];

const SECURITY: &[&str] = &[
    "security", "cybersecurity", "cyber security", "infosec", "pentest", "penetration testing",
    "pen testing", "pen-test", "ethical hacking", "white hat", "white-hat", "security research",
    "soc", "security operations center", "security analyst", "siem", "security information",
    "event management", "soc analyst", "tier 1", "tier 2", "tier 3 security", "vulnerability",
    "vulnerabilities", "vulnerability assessment", "vulnerability scanning", "vuln scan",
    "security assessment", "pentesting", "security audit", "owasp", "owasp top 10",
    "security standard", "iso 27001", "pci dss", "gdpr", "hipaa", "compliance", "malware",
    "malware analysis", "ransomware", "virus", "phishing", "social engineering",
    "threat intelligence", "threat hunting", "incident response", "ir", "incident handling",
    "forensics", "secure coding", "security review", "code review", "security testing",
    "application security", "appsec", "web security", "network security", "endpoint security",
    "mobile security", "cloud security", "injection", "sql injection", "xss", "csrf",
    "cross-site scripting", "authentication", "authorization", "zero trust", "encryption",
    "cryptography", "cryptographic", "firewall", "ids", "ips", "intrusion detection",
    "intrusion prevention", "dlp", "data loss prevention", "metasploit", "burp suite", "nmap",
    "wireshark", "snort", "splunk", "qradar", "arcsight", "qualys", "rapid7",
];

const IT_SUPPORT: &[&str] = &[
    "it support", "it support specialist", "technical support", "helpdesk", "help desk",
    "service desk", "support analyst", "sysadmin", "system administrator", "linux admin",
    "windows admin", "system administration", "systems administration", "systems admin",
    "server administration", "server admin", "infrastructure administration", "network",
    "networking", "network engineer", "network administrator", "network support",
    "network operations", "netops", "noc", "dns", "domain", "domain name system", "bind", "vpn",
    "virtual private network", "remote access", "ip addressing", "subnetting", "routing",
    "switch", "router", "active directory", "ad", "ldap", "domain controller", "dc",
    "identity management", "idm", "iam", "access management", "user management",
    "account management", "provisioning", "deprovisioning", "desktop support",
    "endpoint management", "device management", "desktop administration", "windows desktop",
    "macos", "linux desktop", "endpoint", "endpoints", "workstation", "laptop", "mobile device",
    "it operations", "it ops", "operations", "maintenance", "break-fix", "troubleshooting",
    "issue resolution", "tier 1", "tier 2", "system monitoring", "performance monitoring",
    "log analysis", "alerting", "on-call", "incident management", "ticketing", "windows server",
    "windows administration", "microsoft", "exchange", "office 365", "o365", "intune", "sccm",
    "system center", "linux administration", "linux engineering", "rhel", "centos", "ubuntu",
    "shell scripting", "bash scripting", "linux commands", "vmware", "virtualization",
    "hypervisor", "virtual machine", "vm", "hyper-v", "virtualbox", "kvm", "xen",
];

const REMOTE: &[&str] = &[
    "remote", "remote work", "remote job", "remote position", "wfh", "work from home",
    "work-from-home", "telecommute", "telecommuting", "telework", "teleworking", "virtual",
    "virtual office", "distributed team", "location independent", "location-independent",
    "freelance", "freelancer", "freelancing", "contract", "contractor", "contracting",
    "contract-to-hire", "contract position", "project-based", "project based", "project work",
    "consultant", "consulting", "independent", "self-employed", "temporary", "temp", "flexible",
    "flexible schedule", "flexitime", "hybrid", "hybrid work", "remote-first", "digital nomad",
    "nomad", "asynchronous", "async", "async communication", "global", "worldwide",
    "remote-friendly", "remote ok", "remote possible", "work from anywhere", "wfa",
    "home-based",
];

const NEGATIVE_NONTECH: &[&str] = &[
    "cashier", "cashiering", "cash register", "store clerk", "waiter", "waitress", "bartender",
    "barista", "barback", "sommelier", "host", "hostess", "food service", "restaurant",
    "fast food", "food runner", "delivery driver", "food delivery", "uber eats", "doordash",
    "grubhub", "restaurant server", "food server", "serving tables", "table server", "driver",
    "truck driver", "chauffeur", "warehouse", "warehousing", "picker", "packer", "stock clerk",
    "construction", "laborer", "builder", "tradesperson", "carpenter", "electrician", "plumber",
    "welder", "painter", "cleaner", "cleaning", "custodian", "janitor", "caretaker",
    "maintenance", "repair", "technician", "mechanic", "auto repair", "landscaping", "gardener",
    "groundkeeper", "lawn care", "security guard", "guard", "bouncer", "doorman",
    "loss prevention", "store detective", "loss prevention officer", "receptionist",
    "front desk", "customer service representative", "csr", "call center", "call center agent",
    "telemarketer", "telemarketing", "customer support", "support agent", "phone support",
    "teacher", "teaching", "tutor", "education", "instructor", "professor", "lecturer",
    "academic", "faculty", "teacher aide", "teaching assistant", "nurse", "doctor", "physician",
    "medical", "healthcare", "caregiver", "home health aide", "medical assistant", "retail",
    "sales associate", "salesperson", "sales representative", "account manager",
    "business development", "sales executive", "insurance agent", "real estate agent",
    "data entry", "data entry clerk", "typist", "filing", "administrative assistant",
    "admin assistant", "office clerk", "office admin", "hotel", "hospitality", "hotel staff",
    "concierge", "taxi", "cab driver", "delivery person", "courier", "manufacturing", "factory",
    "assembly line", "production worker", "quality control", "qc", "inspector", "production",
    "loader", "unloader", "mover", "warehouse worker", "stocking", "inventory", "general labor",
    "manual labor", "physical labor",
];
