use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "bold", "brave", "brisk", "calm", "clever", "cosmic", "crimson",
    "crisp", "daring", "dusty", "eager", "electric", "fancy", "fearless", "frosty", "gentle",
    "golden", "happy", "hidden", "humble", "icy", "jolly", "keen", "lively", "lucky", "mellow",
    "misty", "nimble", "noble", "polar", "proud", "quiet", "rapid", "rustic", "shiny", "silent",
    "snowy", "solar", "steady", "sunny", "swift", "tidy", "velvet", "vivid", "wild", "witty",
    "young",
];

const NOUNS: &[&str] = &[
    "alpaca", "badger", "beacon", "birch", "canyon", "cedar", "comet", "coral", "crane", "delta",
    "falcon", "fern", "fjord", "forest", "fox", "glacier", "harbor", "heron", "island", "lagoon",
    "lynx", "maple", "meadow", "meteor", "moose", "orbit", "otter", "owl", "panda", "pebble",
    "pine", "planet", "prairie", "puffin", "quartz", "raven", "reef", "ridge", "river", "robin",
    "sparrow", "spruce", "summit", "tundra", "valley", "walrus", "willow", "wolf", "yak", "zephyr",
];

/// Two-word alias such as `frosty-otter`.
pub fn generate_alias() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    format!("{}-{}", adjective, noun)
}

/// Generates aliases until one is not in `taken`.
pub fn unique_alias(taken: &[String]) -> String {
    for _ in 0..64 {
        let alias = generate_alias();
        if !taken.contains(&alias) {
            return alias;
        }
    }
    let base = generate_alias();
    (1..)
        .map(|n| format!("{}-{}", base, n))
        .find(|alias| !taken.contains(alias))
        .unwrap_or(base)
}

/// Random unicast MAC address with the locally administered bit set.
pub fn generate_mac() -> String {
    let mut rng = rand::rng();
    let mut octets = [0u8; 6];
    rng.fill(&mut octets);
    octets[0] = (octets[0] & 0xfc) | 0x02;
    octets
        .iter()
        .map(|o| format!("{:02x}", o))
        .collect::<Vec<_>>()
        .join(":")
}

/// Dash-joined random words, used when the user leaves an archive passphrase empty.
pub fn generate_passphrase(words: usize) -> String {
    let mut rng = rand::rng();
    (0..words)
        .map(|i| {
            let list = if i % 2 == 0 { ADJECTIVES } else { NOUNS };
            list[rng.random_range(0..list.len())]
        })
        .collect::<Vec<_>>()
        .join("-")
}
