pub mod common {
    pub mod v1 {
        tonic::include_proto!("skein.common.v1");
    }
}

pub mod runner {
    pub mod v1 {
        tonic::include_proto!("skein.runner.v1");
    }
}

pub mod handler {
    pub mod v1 {
        tonic::include_proto!("skein.handler.v1");
    }
}

pub mod manager {
    pub mod v1 {
        tonic::include_proto!("skein.manager.v1");
    }
}
