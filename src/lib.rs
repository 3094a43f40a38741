pub mod cli;

pub mod config {
    pub mod config;
}

pub mod image {
    pub mod archive;
    pub mod download;
}

pub mod kvm {
    pub mod dhcp;
    pub mod qemu;
    pub mod ssh;
    pub mod terminal;
}

pub mod lifecycle {
    pub mod batch;
    pub mod lock;
    pub mod orchestrator;
}

pub mod machine {
    pub mod config;
    pub mod credential;
    pub mod names;
    pub mod port;
    pub mod validate;
}
